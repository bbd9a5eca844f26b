// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lookup resolved by asking remote nameservers.

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::core::Core;
use crate::lookup::Lookup;
use crate::op::{Query, Response, ResponseCode};
use crate::resolver::Handler;
use crate::tcp::TcpConnection;
use crate::udp::UdpTransport;

/// What a buffered UDP response amounted to
pub(crate) enum UdpOutcome {
    /// Not for this lookup, or arrived after a terminal event
    Ignored,
    /// Consumed without reaching user space (TCP upgrade started)
    Processed,
    /// Consumed; the caller must now run the handler
    Deliver(Rc<dyn Handler>, Response),
}

pub(crate) struct RemoteLookup {
    core: Weak<RefCell<Core>>,
    query: Query,
    /// cleared once a terminal event has been reported; every later
    /// transport event then falls through silently
    handler: Option<Rc<dyn Handler>>,
    /// datagrams sent so far
    count: usize,
    /// when the lookup last went on the wire
    last: Option<Instant>,
    /// the `(transport, nameserver)` pairs currently routing responses here
    subscriptions: SmallVec<[(Rc<RefCell<UdpTransport>>, IpAddr); 2]>,
    /// while present, further datagram responses are ignored
    connection: Option<Rc<RefCell<TcpConnection>>>,
    self_ref: Weak<Lookup>,
}

impl RemoteLookup {
    pub(crate) fn new(
        core: Weak<RefCell<Core>>,
        query: Query,
        handler: Rc<dyn Handler>,
        self_ref: Weak<Lookup>,
    ) -> Self {
        Self {
            core,
            query,
            handler: Some(handler),
            count: 0,
            last: None,
            subscriptions: SmallVec::new(),
            connection: None,
            self_ref,
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    pub(crate) fn credits(&self, attempts: usize) -> usize {
        attempts.saturating_sub(self.count)
    }

    pub(crate) fn timestamp(&self) -> Option<Instant> {
        self.last
    }

    /// Send the next datagram.
    ///
    /// The nameserver for attempt `count` is `count mod n`, shifted by the
    /// query id when rotation is on so concurrent lookups spread over the
    /// servers. A failed send is deliberately indistinguishable from a lost
    /// datagram: the attempt is counted and the timeout drives the retry.
    pub(crate) fn execute(&mut self, now: Instant) -> bool {
        if let Some(core) = self.core.upgrade() {
            let core = core.borrow();
            let nameservers = core.nameservers();
            if nameservers.is_empty() {
                warn!("no nameservers to send {} to", self.query);
            } else {
                let offset = if core.rotate() {
                    usize::from(self.query.id())
                } else {
                    0
                };
                let nameserver = nameservers[(self.count + offset) % nameservers.len()];

                if let Some(transport) = core.datagram(nameserver, &self.query) {
                    self.subscribe(transport, nameserver);
                }
            }
        }

        self.count += 1;
        self.last = Some(now);
        true
    }

    fn subscribe(&mut self, transport: Rc<RefCell<UdpTransport>>, peer: IpAddr) {
        // a retry against the same server reuses the existing subscription
        let exists = self
            .subscriptions
            .iter()
            .any(|(t, ip)| Rc::ptr_eq(t, &transport) && *ip == peer);
        if exists {
            return;
        }

        transport
            .borrow_mut()
            .subscribe(self.self_ref.clone(), peer, self.query.id());
        self.subscriptions.push((transport, peer));
    }

    fn unsubscribe_all(&mut self) {
        for (transport, peer) in self.subscriptions.drain(..) {
            transport
                .borrow_mut()
                .unsubscribe(&self.self_ref, peer, self.query.id());
        }
    }

    /// Tear the lookup down before reporting: clear the handler so later
    /// events are no-ops, drop the TCP connection, unsubscribe everywhere,
    /// and hand the lookup to the scheduler's release queue. Returns the
    /// handler that still has to be called, if any.
    fn cleanup(&mut self) -> Option<Rc<dyn Handler>> {
        let handler = self.handler.take();
        self.connection = None;
        self.unsubscribe_all();

        if handler.is_some() {
            if let (Some(core), Some(lookup)) = (self.core.upgrade(), self.self_ref.upgrade()) {
                core.borrow_mut().done(&lookup);
            }
        }
        handler
    }

    /// Rewrite an NXDOMAIN into a clean empty answer when the hosts
    /// database knows the name: a host that resolves locally must not look
    /// nonexistent just because the nameserver never heard of it.
    fn rewrite(&self, response: Response) -> Response {
        if response.response_code() != ResponseCode::NXDomain {
            return response;
        }
        let Some(core) = self.core.upgrade() else {
            return response;
        };

        let listed = core.borrow().hosts().contains(self.query.question().name());
        if listed {
            debug!("rewriting NXDOMAIN for locally listed {}", self.query);
            Response::synthesize(&self.query, ResponseCode::NoError, false)
        } else {
            response
        }
    }

    pub(crate) fn on_udp_response(&mut self, peer: IpAddr, response: Response) -> UdpOutcome {
        if self.handler.is_none() {
            return UdpOutcome::Ignored;
        }
        if !self.query.matches(&response) {
            return UdpOutcome::Ignored;
        }
        if self.connection.is_some() {
            return UdpOutcome::Ignored;
        }

        if !response.truncated() {
            let response = self.rewrite(response);
            return match self.cleanup() {
                Some(handler) => UdpOutcome::Deliver(handler, response),
                None => UdpOutcome::Processed,
            };
        }

        // truncated: retry the query over a stream to the same server; the
        // connection gets a fresh timeout budget
        let Some(core) = self.core.upgrade() else {
            return UdpOutcome::Processed;
        };
        let (reactor, port) = {
            let core = core.borrow();
            (core.reactor(), core.port())
        };
        self.connection = Some(TcpConnection::new(
            reactor,
            peer,
            port,
            &self.query,
            response,
            self.self_ref.clone(),
        ));
        self.unsubscribe_all();
        self.last = Some(Instant::now());

        UdpOutcome::Processed
    }

    pub(crate) fn on_tcp_response(&mut self, response: Response) -> Option<(Rc<dyn Handler>, Response)> {
        if self.handler.is_none() {
            return None;
        }
        if !self.query.matches(&response) {
            return None;
        }

        let response = self.rewrite(response);
        self.cleanup().map(|handler| (handler, response))
    }

    pub(crate) fn on_tcp_failure(&mut self, truncated: Response) -> Option<(Rc<dyn Handler>, Response)> {
        if self.handler.is_none() {
            return None;
        }

        debug!("tcp retry failed, surfacing truncated answer for {}", self.query);
        self.cleanup().map(|handler| (handler, truncated))
    }

    pub(crate) fn timeout(&mut self) -> Option<Rc<dyn Handler>> {
        self.cleanup()
    }

    pub(crate) fn cancel(&mut self) -> Option<Rc<dyn Handler>> {
        if self.handler.is_none() {
            return None;
        }
        self.cleanup()
    }
}
