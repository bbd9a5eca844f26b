// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lookup scheduler.
//!
//! All lookups flow through three queues:
//!
//! * `scheduled` — waiting for their first or next send,
//! * `inflight`  — sent, waiting for a response; ordered by send time so
//!   the front is always the next to time out,
//! * `ready`     — outcome decided, handler already fired; waiting to be
//!   released under the per-tick budget.
//!
//! A single timer drives everything: it is armed at zero whenever there is
//! immediate work (new lookups, buffered responses, unreleased ready
//! lookups) and otherwise at the moment the oldest in-flight lookup times
//! out. Every firing runs one [`expire`] tick.
//!
//! [`expire`]: Core::expire

use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::{ResolverConfig, ResolverOpts};
use crate::hosts::Hosts;
use crate::lookup::Lookup;
use crate::queue::{Queue, QueueTag};
use crate::reactor::{Monitor, Reactor, TimerId};
use crate::udp::{Family, UdpTransport};
use crate::watcher::Watcher;

/// Upper bound on user callbacks dispatched per tick. Responses beyond the
/// budget stay buffered; the timer re-arms at zero to drain them next tick.
const MAX_CALLS_PER_TICK: usize = 8;

pub(crate) struct Core {
    reactor: Rc<dyn Reactor>,
    /// timer callback shim, reused for every arming
    monitor: Rc<dyn Monitor>,
    ipv4: Rc<RefCell<UdpTransport>>,
    ipv6: Rc<RefCell<UdpTransport>>,
    config: ResolverConfig,
    pub(crate) opts: ResolverOpts,
    hosts: Hosts,
    scheduled: Queue,
    inflight: Queue,
    ready: Queue,
    /// the single armed timer, if any
    timer: Option<TimerId>,
    /// flips to false on shutdown; watchers observe it mid-tick
    alive: Rc<Cell<bool>>,
    closed: bool,
}

/// Timer callback shim; weak so the reactor never keeps the core alive
struct CoreMonitor(Weak<RefCell<Core>>);

impl Monitor for CoreMonitor {
    fn expire(&self) {
        if let Some(core) = self.0.upgrade() {
            Core::expire(&core);
        }
    }
}

impl Core {
    pub(crate) fn new(
        reactor: Rc<dyn Reactor>,
        config: ResolverConfig,
        opts: ResolverOpts,
        hosts: Hosts,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref: &Weak<RefCell<Core>>| {
            RefCell::new(Self {
                monitor: Rc::new(CoreMonitor(self_ref.clone())),
                ipv4: UdpTransport::new(reactor.clone(), self_ref.clone(), Family::V4),
                ipv6: UdpTransport::new(reactor.clone(), self_ref.clone(), Family::V6),
                reactor,
                config,
                opts,
                hosts,
                scheduled: Queue::new(QueueTag::Scheduled),
                inflight: Queue::new(QueueTag::Inflight),
                ready: Queue::new(QueueTag::Ready),
                timer: None,
                alive: Rc::new(Cell::new(true)),
                closed: false,
            })
        })
    }

    pub(crate) fn reactor(&self) -> Rc<dyn Reactor> {
        self.reactor.clone()
    }

    pub(crate) fn nameservers(&self) -> &[IpAddr] {
        self.config.nameservers()
    }

    pub(crate) fn rotate(&self) -> bool {
        self.opts.rotate
    }

    pub(crate) fn port(&self) -> u16 {
        self.opts.port
    }

    pub(crate) fn hosts(&self) -> &Hosts {
        &self.hosts
    }

    pub(crate) fn set_hosts(&mut self, hosts: Hosts) {
        self.hosts = hosts;
    }

    /// Change the in-flight bound. Raising it may unpark waiting lookups,
    /// which no armed timer would otherwise pick up, so ask for a tick.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.opts.capacity = capacity;
        if !self.closed && !self.scheduled.is_empty() {
            self.reschedule_now();
        }
    }

    /// Accept a new lookup: queue it and ask for an immediate tick. Bursts
    /// of queries coalesce into one firing.
    pub(crate) fn add(&mut self, lookup: Rc<Lookup>) {
        if self.closed {
            debug!("dropping lookup added after shutdown");
            return;
        }
        self.scheduled.push(lookup);
        self.reschedule_now();
    }

    /// A transport buffered responses: make the next tick happen now
    pub(crate) fn on_buffered(&mut self) {
        if self.closed {
            return;
        }
        self.reschedule_now();
    }

    fn reschedule_now(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.reactor.cancel(timer);
        }
        self.timer = Some(self.reactor.timer(Duration::ZERO, self.monitor.clone()));
    }

    /// Route a datagram to the transport of the target's family; returns
    /// the transport to subscribe on when the send went out.
    pub(crate) fn datagram(&self, ip: IpAddr, query: &crate::op::Query) -> Option<Rc<RefCell<UdpTransport>>> {
        let transport = match Family::of(ip) {
            Family::V4 => &self.ipv4,
            Family::V6 => &self.ipv6,
        };
        let sent = transport
            .borrow_mut()
            .send(ip, query, self.opts.port, self.opts.buffer_size);
        sent.then(|| transport.clone())
    }

    /// A lookup's outcome was decided: move it from whichever queue holds
    /// it onto the release queue.
    pub(crate) fn done(&mut self, lookup: &Rc<Lookup>) {
        if self.closed {
            return;
        }

        if let Some(position) = lookup.position() {
            match position.tag {
                QueueTag::Inflight => {
                    self.inflight.remove(lookup);
                }
                // cancelled before it was ever sent
                QueueTag::Scheduled => {
                    self.scheduled.remove(lookup);
                }
                QueueTag::Ready => return,
            }
        }
        self.ready.push(lookup.clone());
    }

    /// One scheduler tick.
    ///
    /// The ordering is deliberate: buffered responses first (they free
    /// in-flight slots), then releases, then new sends up to capacity, then
    /// the timeout scan, then re-arming. User handlers run inside several
    /// steps; after each of those the watcher decides whether the resolver
    /// still exists.
    pub(crate) fn expire(this: &Rc<RefCell<Self>>) {
        let (watcher, ipv4, ipv6) = {
            let mut core = this.borrow_mut();
            if core.closed {
                return;
            }
            // the timer fired (or is about to be replaced); forget it
            if let Some(timer) = core.timer.take() {
                core.reactor.cancel(timer);
            }
            (Watcher::new(&core.alive), core.ipv4.clone(), core.ipv6.clone())
        };
        let now = Instant::now();
        trace!("tick");

        // deliver buffered responses, both families sharing one budget
        let mut budget = MAX_CALLS_PER_TICK;
        budget -= UdpTransport::deliver(&ipv4, budget);
        if !watcher.valid() {
            return;
        }
        budget -= UdpTransport::deliver(&ipv6, budget);
        if !watcher.valid() {
            return;
        }

        // release decided lookups; their handlers already ran
        {
            let mut core = this.borrow_mut();
            let releases = budget.min(core.ready.len());
            for _ in 0..releases {
                core.ready.pop_front();
            }
        }
        if !watcher.valid() {
            return;
        }

        // start scheduled lookups while there is capacity
        loop {
            let lookup = {
                let mut core = this.borrow_mut();
                if core.inflight.len() >= core.opts.capacity {
                    break;
                }
                match core.scheduled.pop_front() {
                    Some(lookup) => lookup,
                    None => break,
                }
            };

            // may run a user handler (local lookups deliver here)
            let inflight = Lookup::execute(&lookup, now);
            if !watcher.valid() {
                return;
            }

            let mut core = this.borrow_mut();
            let attempts = core.opts.attempts;
            if inflight {
                core.inflight.push(lookup);
            } else if lookup.credits(attempts) > 0 {
                core.scheduled.push(lookup);
            } else if lookup.position().is_none() {
                core.ready.push(lookup);
            }
        }

        // time out stale in-flight lookups: retry while credits remain,
        // otherwise report the timeout
        loop {
            let expired = {
                let mut core = this.borrow_mut();
                let timeout = core.opts.timeout;
                let stale = core
                    .inflight
                    .front()
                    .and_then(|lookup| lookup.timestamp())
                    .is_some_and(|sent| sent + timeout <= now);
                if !stale {
                    break;
                }

                let lookup = core.inflight.pop_front().expect("front was stale");
                if lookup.credits(core.opts.attempts) > 0 {
                    debug!("retrying lookup {}", lookup.query_id());
                    core.scheduled.push(lookup);
                    None
                } else {
                    Some(lookup)
                }
            };

            if let Some(lookup) = expired {
                debug!("lookup {} ran out of attempts", lookup.query_id());
                Lookup::timeout(&lookup);
                if !watcher.valid() {
                    return;
                }
            }
        }

        // re-arm
        let mut core = this.borrow_mut();
        core.rearm(now);
    }

    /// Arm the timer for the earliest upcoming event, or not at all when
    /// the scheduler has gone idle.
    fn rearm(&mut self, now: Instant) {
        // a handler already armed an immediate tick; nothing sooner exists
        if self.timer.is_some() {
            return;
        }

        let delay = if !self.ready.is_empty() {
            // more releases (or budget-deferred deliveries) next tick
            Some(Duration::ZERO)
        } else if !self.scheduled.is_empty() && self.inflight.len() < self.opts.capacity {
            // retries waiting for a slot that is already free
            Some(Duration::ZERO)
        } else if let Some(sent) = self.inflight.front().and_then(|lookup| lookup.timestamp()) {
            Some((sent + self.opts.timeout).saturating_duration_since(now))
        } else if self.scheduled.is_empty() {
            // a fully idle scheduler expects no replies; release the
            // sockets until the next query
            self.ipv4.borrow_mut().close();
            self.ipv6.borrow_mut().close();
            None
        } else {
            // capacity is zero: waiting lookups stay parked, with their
            // subscriptions, until the capacity is raised
            debug_assert_eq!(self.opts.capacity, 0);
            None
        };

        if let Some(delay) = delay {
            self.timer = Some(self.reactor.timer(delay, self.monitor.clone()));
        }
    }

    /// Tear the scheduler down. With `cancel`, every outstanding lookup
    /// fires `on_cancelled`; without, everything is discarded silently (the
    /// drop path must not call back into user code).
    pub(crate) fn shutdown(this: &Rc<RefCell<Self>>, cancel: bool) {
        let lookups = {
            let mut core = this.borrow_mut();
            if core.closed {
                return;
            }
            core.closed = true;
            core.alive.set(false);
            if let Some(timer) = core.timer.take() {
                core.reactor.cancel(timer);
            }
            core.ipv4.borrow_mut().close();
            core.ipv6.borrow_mut().close();

            let mut all = Vec::with_capacity(
                core.scheduled.len() + core.inflight.len() + core.ready.len(),
            );
            while let Some(lookup) = core.scheduled.pop_front() {
                all.push(lookup);
            }
            while let Some(lookup) = core.inflight.pop_front() {
                all.push(lookup);
            }
            while let Some(lookup) = core.ready.pop_front() {
                all.push(lookup);
            }
            all
        };

        if cancel {
            for lookup in &lookups {
                Lookup::cancel(lookup);
            }
        }
    }
}
