// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bundled single-threaded event loop built on mio.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::trace;

use crate::reactor::{Interest, Monitor, Reactor, RegistrationId, TimerId};

/// A ready-to-use [`Reactor`] over `mio::Poll`.
///
/// Single-threaded: monitors run on the thread that calls [`run`] or
/// [`run_once`], and registration happens from those same callbacks.
///
/// [`run`]: PollReactor::run
/// [`run_once`]: PollReactor::run_once
pub struct PollReactor {
    inner: RefCell<Inner>,
}

struct Inner {
    poll: Poll,
    events: Events,
    next_id: u64,
    registrations: HashMap<Token, Rc<dyn Monitor>>,
    /// armed timers; cancellation removes the entry and the heap skips it
    timers: HashMap<TimerId, Rc<dyn Monitor>>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl PollReactor {
    /// Create a new reactor
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: RefCell::new(Inner {
                poll: Poll::new()?,
                events: Events::with_capacity(64),
                next_id: 0,
                registrations: HashMap::new(),
                timers: HashMap::new(),
                deadlines: BinaryHeap::new(),
            }),
        })
    }

    /// Whether any registration or timer is outstanding
    pub fn is_active(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.registrations.is_empty() || !inner.timers.is_empty()
    }

    /// Run one iteration: wait for readiness or the next timer (at most
    /// `max_wait`, if given) and dispatch everything that came due.
    ///
    /// Returns `false` when there was nothing to wait for.
    pub fn run_once(&self, max_wait: Option<Duration>) -> io::Result<bool> {
        if !self.is_active() {
            return Ok(false);
        }

        let now = Instant::now();
        let timeout = {
            let inner = self.inner.borrow();
            let until_timer = inner.next_deadline().map(|deadline| {
                deadline.checked_duration_since(now).unwrap_or(Duration::ZERO)
            });
            match (until_timer, max_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, wait) => wait,
            }
        };

        // readiness first, then due timers
        let ready: Vec<Rc<dyn Monitor>> = {
            let mut inner = self.inner.borrow_mut();
            let Inner {
                poll,
                events,
                registrations,
                ..
            } = &mut *inner;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            events
                .iter()
                .filter_map(|event| registrations.get(&event.token()).cloned())
                .collect()
        };
        for monitor in &ready {
            monitor.notify();
        }
        let mut dispatched = !ready.is_empty();

        // fire timers one at a time: an expire callback may arm or cancel
        // other timers, so the borrow cannot be held across the dispatch
        let now = Instant::now();
        loop {
            let monitor = {
                let mut inner = self.inner.borrow_mut();
                match inner.deadlines.peek() {
                    Some(&Reverse((deadline, id))) if deadline <= now => {
                        inner.deadlines.pop();
                        inner.timers.remove(&TimerId(id))
                    }
                    _ => break,
                }
            };
            // a vacant entry means the timer was cancelled
            if let Some(monitor) = monitor {
                dispatched = true;
                monitor.expire();
            }
        }

        Ok(dispatched)
    }

    /// Run until no registration or timer remains
    pub fn run(&self) -> io::Result<()> {
        while self.is_active() {
            self.run_once(None)?;
        }
        Ok(())
    }
}

impl Inner {
    /// Earliest deadline of a still-armed timer
    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines
            .iter()
            .filter(|Reverse((_, id))| self.timers.contains_key(&TimerId(*id)))
            .map(|Reverse((deadline, _))| *deadline)
            .min()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Reactor for PollReactor {
    fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        monitor: Rc<dyn Monitor>,
    ) -> io::Result<RegistrationId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        let token = Token(id as usize);

        let interest = match interest {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
            Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
        };
        inner
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;
        inner.registrations.insert(token, monitor);

        trace!("watching fd {} as {:?}", fd, token);
        Ok(RegistrationId(id))
    }

    fn remove(&self, id: RegistrationId, fd: RawFd) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.registrations.remove(&Token(id.0 as usize));
        inner.poll.registry().deregister(&mut SourceFd(&fd))?;

        trace!("dropped fd {}", fd);
        Ok(())
    }

    fn timer(&self, delay: Duration, monitor: Rc<dyn Monitor>) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        let id = TimerId(inner.next_id());
        let deadline = Instant::now() + delay;

        inner.timers.insert(id, monitor);
        inner.deadlines.push(Reverse((deadline, id.0)));
        id
    }

    fn cancel(&self, id: TimerId) {
        self.inner.borrow_mut().timers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Flag(Rc<Cell<usize>>);

    impl Monitor for Flag {
        fn expire(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_timer_fires_once() {
        let reactor = PollReactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        reactor.timer(Duration::ZERO, Rc::new(Flag(fired.clone())));

        reactor.run().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!reactor.is_active());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let reactor = PollReactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let id = reactor.timer(Duration::ZERO, Rc::new(Flag(fired.clone())));
        reactor.cancel(id);

        assert!(!reactor.is_active());
        reactor.run().unwrap();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        struct Order(Rc<RefCell<Vec<u32>>>, u32);
        impl Monitor for Order {
            fn expire(&self) {
                self.0.borrow_mut().push(self.1);
            }
        }

        let reactor = PollReactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        reactor.timer(Duration::from_millis(20), Rc::new(Order(order.clone(), 2)));
        reactor.timer(Duration::from_millis(5), Rc::new(Order(order.clone(), 1)));

        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
