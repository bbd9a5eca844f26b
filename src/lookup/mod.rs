// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-query state machines.
//!
//! A [`Lookup`] is the scheduler's unit of work: one outstanding question
//! with its retry, subscription and delivery state. Remote lookups talk to
//! nameservers; local lookups answer from the hosts database but still
//! deliver in a later tick so every lookup behaves the same to user code.
//!
//! Borrow discipline: the mutable state sits in a `RefCell` and every user
//! callback is dispatched only after that borrow is released, so handlers
//! may freely cancel lookups (including the one being reported) or enqueue
//! new ones. The queue position lives outside the `RefCell` for the same
//! reason: queue surgery happens while lookup state is borrowed.

mod local;
mod remote;

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::op::Response;
use crate::queue::{Position, PositionCell};
use crate::resolver::Handler;

pub(crate) use self::local::LocalLookup;
pub(crate) use self::remote::RemoteLookup;

pub(crate) struct Lookup {
    position: PositionCell,
    kind: RefCell<LookupKind>,
}

pub(crate) enum LookupKind {
    Remote(RemoteLookup),
    Local(LocalLookup),
}

impl Lookup {
    pub(crate) fn from_kind(build: impl FnOnce(Weak<Lookup>) -> LookupKind) -> Rc<Self> {
        Rc::new_cyclic(|self_ref: &Weak<Lookup>| Self {
            position: PositionCell::default(),
            kind: RefCell::new(build(self_ref.clone())),
        })
    }

    pub(crate) fn position(&self) -> Option<Position> {
        self.position.get()
    }

    pub(crate) fn set_position(&self, position: Option<Position>) {
        self.position.set(position);
    }

    /// The transaction id of the underlying query
    pub(crate) fn query_id(&self) -> u16 {
        match &*self.kind.borrow() {
            LookupKind::Remote(remote) => remote.query().id(),
            LookupKind::Local(local) => local.query().id(),
        }
    }

    /// Remaining send attempts, given the configured total
    pub(crate) fn credits(&self, attempts: usize) -> usize {
        match &*self.kind.borrow() {
            LookupKind::Remote(remote) => remote.credits(attempts),
            LookupKind::Local(local) => local.credits(),
        }
    }

    /// When the lookup last went on the wire
    pub(crate) fn timestamp(&self) -> Option<Instant> {
        match &*self.kind.borrow() {
            LookupKind::Remote(remote) => remote.timestamp(),
            LookupKind::Local(local) => local.timestamp(),
        }
    }

    /// Run the lookup once. Returns whether it now waits for a response
    /// (and belongs in the in-flight queue).
    pub(crate) fn execute(this: &Rc<Self>, now: Instant) -> bool {
        let (inflight, deliver) = match &mut *this.kind.borrow_mut() {
            LookupKind::Remote(remote) => (remote.execute(now), None),
            LookupKind::Local(local) => local.execute(now),
        };

        if let Some((handler, response)) = deliver {
            handler.on_received(&Operation::new(this), response);
        }
        inflight
    }

    /// A response came in over the shared UDP socket. Returns whether this
    /// lookup consumed it.
    pub(crate) fn on_udp_response(this: &Rc<Self>, peer: IpAddr, response: Response) -> bool {
        let outcome = match &mut *this.kind.borrow_mut() {
            LookupKind::Remote(remote) => remote.on_udp_response(peer, response),
            // local lookups never subscribe
            LookupKind::Local(_) => return false,
        };

        match outcome {
            remote::UdpOutcome::Ignored => false,
            remote::UdpOutcome::Processed => true,
            remote::UdpOutcome::Deliver(handler, response) => {
                handler.on_received(&Operation::new(this), response);
                true
            }
        }
    }

    /// The TCP retry produced a full response
    pub(crate) fn on_tcp_response(this: &Rc<Self>, response: Response) {
        let report = match &mut *this.kind.borrow_mut() {
            LookupKind::Remote(remote) => remote.on_tcp_response(response),
            LookupKind::Local(_) => None,
        };

        if let Some((handler, response)) = report {
            handler.on_received(&Operation::new(this), response);
        }
    }

    /// The TCP retry failed; the stashed truncated answer comes back up
    pub(crate) fn on_tcp_failure(this: &Rc<Self>, truncated: Response) {
        let report = match &mut *this.kind.borrow_mut() {
            LookupKind::Remote(remote) => remote.on_tcp_failure(truncated),
            LookupKind::Local(_) => None,
        };

        if let Some((handler, response)) = report {
            handler.on_received(&Operation::new(this), response);
        }
    }

    /// No response arrived within the configured attempts
    pub(crate) fn timeout(this: &Rc<Self>) {
        let handler = match &mut *this.kind.borrow_mut() {
            LookupKind::Remote(remote) => remote.timeout(),
            // local lookups never time out
            LookupKind::Local(_) => None,
        };

        if let Some(handler) = handler {
            handler.on_timeout(&Operation::new(this));
        }
    }

    /// Abort the lookup. Idempotent; the terminal callback fires at most
    /// once no matter how this races with responses or timeouts.
    pub(crate) fn cancel(this: &Rc<Self>) {
        let handler = match &mut *this.kind.borrow_mut() {
            LookupKind::Remote(remote) => remote.cancel(),
            LookupKind::Local(local) => local.cancel(),
        };

        if let Some(handler) = handler {
            handler.on_cancelled(&Operation::new(this));
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Rc<Self> {
        use crate::op::{Query, RecordType};

        struct Sink;
        impl Handler for Sink {}

        let query = Query::with_id("lookup.invalid", RecordType::A, 1).expect("static name");
        Self::from_kind(|self_ref| {
            LookupKind::Local(LocalLookup::new(Weak::new(), query, Rc::new(Sink), self_ref))
        })
    }
}

/// A handle on an outstanding lookup, returned from
/// [`Resolver::query`](crate::Resolver::query) and passed back into every
/// handler callback.
///
/// The handle is weak: it never extends the lookup's life, and its methods
/// turn into no-ops once the lookup is gone.
#[derive(Clone)]
pub struct Operation {
    lookup: Weak<Lookup>,
}

impl Operation {
    pub(crate) fn new(lookup: &Rc<Lookup>) -> Self {
        Self {
            lookup: Rc::downgrade(lookup),
        }
    }

    /// The transaction id of the query, while the lookup is alive
    pub fn id(&self) -> Option<u16> {
        self.lookup.upgrade().map(|lookup| lookup.query_id())
    }

    /// Cancel the lookup: pending transport events are dropped silently and
    /// the handler receives `on_cancelled`, unless a terminal event was
    /// already reported.
    pub fn cancel(&self) {
        if let Some(lookup) = self.lookup.upgrade() {
            Lookup::cancel(&lookup);
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .finish()
    }
}
