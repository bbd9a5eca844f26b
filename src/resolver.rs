// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The user-facing resolver.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::config::{self, ResolverConfig, ResolverOpts};
use crate::core::Core;
use crate::error::ResolveResult;
use crate::hosts::Hosts;
use crate::lookup::{LocalLookup, Lookup, LookupKind, Operation, RemoteLookup};
use crate::op::{Query, RecordType, Response, ResponseCode};
use crate::reactor::Reactor;

/// The sink for a lookup's outcome.
///
/// Exactly one terminal callback fires per lookup: a response, a timeout,
/// or a cancellation. All callbacks run inline inside a scheduler tick; it
/// is safe to start new lookups, cancel others (including the one being
/// reported), or shut the resolver down from inside any of them.
pub trait Handler {
    /// A response came in. The default implementation splits on the
    /// response code and forwards to [`on_resolved`](Handler::on_resolved)
    /// or [`on_failure`](Handler::on_failure); override it to see every
    /// response regardless of its code.
    fn on_received(&self, op: &Operation, response: Response) {
        match response.response_code() {
            ResponseCode::NoError => self.on_resolved(op, response),
            code => self.on_failure(op, code),
        }
    }

    /// The lookup succeeded
    fn on_resolved(&self, _op: &Operation, _response: Response) {}

    /// A response arrived, but with an error code
    fn on_failure(&self, _op: &Operation, _code: ResponseCode) {}

    /// Every attempt went unanswered
    fn on_timeout(&self, _op: &Operation) {}

    /// The lookup was cancelled before an outcome was reached
    fn on_cancelled(&self, _op: &Operation) {}
}

/// A stub DNS resolver bound to an event loop.
///
/// The resolver multiplexes any number of concurrent lookups over one UDP
/// socket per address family and delivers results through [`Handler`]
/// callbacks, always from a scheduler tick, never from inside
/// [`query`](Resolver::query) itself.
///
/// Dropping the resolver silently discards outstanding lookups; call
/// [`shutdown`](Resolver::shutdown) first to have them reported as
/// cancelled.
///
/// ```no_run
/// use std::rc::Rc;
/// use stub_resolv::{PollReactor, Operation, RecordType, Resolver, Response};
///
/// struct Print;
///
/// impl stub_resolv::Handler for Print {
///     fn on_resolved(&self, _op: &Operation, response: Response) {
///         println!("{:?}", response.addresses());
///     }
/// }
///
/// let reactor = Rc::new(PollReactor::new()?);
/// let resolver = Resolver::new(reactor.clone())?;
/// resolver.query("www.example.com", RecordType::A, Rc::new(Print))?;
/// reactor.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Resolver {
    core: Rc<RefCell<Core>>,
}

impl Resolver {
    /// Create a resolver from the system configuration: nameservers and
    /// options from `/etc/resolv.conf`, local names from `/etc/hosts`.
    pub fn new(reactor: Rc<dyn Reactor>) -> ResolveResult<Self> {
        let (config, opts) = config::system_conf()?;
        let hosts = Hosts::new()?;
        Ok(Self::with_parts(reactor, config, opts, hosts))
    }

    /// Create a resolver from an explicit configuration, with an empty
    /// hosts database.
    pub fn from_conf(reactor: Rc<dyn Reactor>, config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self::with_parts(reactor, config, opts, Hosts::default())
    }

    fn with_parts(
        reactor: Rc<dyn Reactor>,
        config: ResolverConfig,
        opts: ResolverOpts,
        hosts: Hosts,
    ) -> Self {
        Self {
            core: Core::new(reactor, config, opts, hosts),
        }
    }

    /// Replace the hosts database
    pub fn set_hosts(&self, hosts: Hosts) {
        self.core.borrow_mut().set_hosts(hosts);
    }

    /// The current options
    pub fn options(&self) -> ResolverOpts {
        self.core.borrow().opts.clone()
    }

    /// Time to wait for a response after the last send
    pub fn set_timeout(&self, timeout: Duration) {
        self.core.borrow_mut().opts.timeout = timeout;
    }

    /// Spacing between retransmissions; equal to the timeout in this design
    pub fn set_interval(&self, interval: Duration) {
        self.core.borrow_mut().opts.interval = interval;
    }

    /// Number of datagrams to send per lookup before giving up
    pub fn set_attempts(&self, attempts: usize) {
        self.core.borrow_mut().opts.attempts = attempts;
    }

    /// Maximum number of simultaneously in-flight lookups. Zero sends
    /// nothing: queued lookups stay parked until the capacity is raised.
    pub fn set_capacity(&self, capacity: usize) {
        self.core.borrow_mut().set_capacity(capacity);
    }

    /// Spread attempts over the nameservers instead of always starting at
    /// the first
    pub fn set_rotate(&self, rotate: bool) {
        self.core.borrow_mut().opts.rotate = rotate;
    }

    /// Send/receive buffer size for the UDP sockets
    pub fn set_buffer_size(&self, buffer_size: usize) {
        self.core.borrow_mut().opts.buffer_size = buffer_size;
    }

    /// Destination port on the nameservers (53 unless testing)
    pub fn set_port(&self, port: u16) {
        self.core.borrow_mut().opts.port = port;
    }

    /// Start a lookup for `name` with the given record type.
    ///
    /// Names with an A/AAAA entry in the hosts database are answered
    /// locally; everything else goes to the configured nameservers. Either
    /// way the handler fires in a later event-loop tick.
    pub fn query(
        &self,
        name: &str,
        query_type: RecordType,
        handler: Rc<dyn Handler>,
    ) -> ResolveResult<Operation> {
        let query = Query::new(name, query_type)?;
        let core = Rc::downgrade(&self.core);

        let local = matches!(query_type, RecordType::A | RecordType::AAAA)
            && self
                .core
                .borrow()
                .hosts()
                .contains(query.question().name());
        let lookup = Lookup::from_kind(|self_ref| {
            if local {
                LookupKind::Local(LocalLookup::new(core, query, handler, self_ref))
            } else {
                LookupKind::Remote(RemoteLookup::new(core, query, handler, self_ref))
            }
        });

        let operation = Operation::new(&lookup);
        self.core.borrow_mut().add(lookup);
        Ok(operation)
    }

    /// Cancel every outstanding lookup (each reports `on_cancelled`) and
    /// release the sockets. Further queries are dropped.
    pub fn shutdown(&self) {
        Core::shutdown(&self.core, true);
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // no callbacks from teardown; shutdown() is the loud path
        Core::shutdown(&self.core, false);
    }
}
