// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shared UDP transport: one socket per address family.
//!
//! All lookups of one family send through the same unconnected socket and
//! register a subscription for the `(peer, transaction-id)` pair they expect
//! an answer from. The readable callback only drains the kernel into an
//! internal buffer; responses reach lookups later, through [`deliver`],
//! under the scheduler's per-tick budget. That split keeps kernel drains
//! cheap and lets a handler cancel other lookups before their buffered
//! responses are dispatched.
//!
//! [`deliver`]: UdpTransport::deliver

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::core::Core;
use crate::lookup::Lookup;
use crate::op::{Query, Response};
use crate::reactor::{Interest, Monitor, Reactor, RegistrationId};

/// Largest datagram we are prepared to receive
const RECEIVE_BUFFER_SIZE: usize = 65_535;

/// The address family a transport serves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

pub(crate) struct UdpTransport {
    reactor: Rc<dyn Reactor>,
    core: Weak<RefCell<Core>>,
    family: Family,
    /// opened on the first send
    socket: Option<UdpSocket>,
    registration: Option<RegistrationId>,
    /// who wants responses from where: `(peer, transaction-id)` -> lookups
    subscriptions: HashMap<(IpAddr, u16), Vec<Weak<Lookup>>>,
    /// drained but not yet dispatched responses
    responses: VecDeque<(IpAddr, Vec<u8>)>,
    self_ref: Weak<RefCell<UdpTransport>>,
}

/// Reactor-facing callback shim; weak so a leftover registration never
/// keeps the transport alive
struct UdpMonitor(Weak<RefCell<UdpTransport>>);

impl Monitor for UdpMonitor {
    fn notify(&self) {
        if let Some(transport) = self.0.upgrade() {
            UdpTransport::on_readable(&transport);
        }
    }
}

impl UdpTransport {
    pub(crate) fn new(
        reactor: Rc<dyn Reactor>,
        core: Weak<RefCell<Core>>,
        family: Family,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref: &Weak<RefCell<Self>>| {
            RefCell::new(Self {
                reactor,
                core,
                family,
                socket: None,
                registration: None,
                subscriptions: HashMap::new(),
                responses: VecDeque::new(),
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Send `query` to `ip:port`, opening the socket on first use.
    ///
    /// Returns whether the datagram went out; the caller only subscribes
    /// for replies on success. A failed send is not an error for the
    /// lookup: it simply never hears back and retries via its timeout.
    pub(crate) fn send(&mut self, ip: IpAddr, query: &Query, port: u16, buffer_size: usize) -> bool {
        if Family::of(ip) != self.family {
            return false;
        }

        if self.socket.is_none() {
            match self.open(buffer_size) {
                Ok(()) => {}
                Err(e) => {
                    warn!("unable to open {:?} datagram socket: {}", self.family, e);
                    return false;
                }
            }
        }

        let socket = self.socket.as_ref().expect("just opened");
        match socket.send_to(query.bytes(), SocketAddr::new(ip, port)) {
            Ok(_) => {
                trace!("sent query {} to {}", query, ip);
                true
            }
            Err(e) => {
                warn!("failed to send query {} to {}: {}", query, ip, e);
                false
            }
        }
    }

    fn open(&mut self, buffer_size: usize) -> std::io::Result<()> {
        let domain = match self.family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        // large buffers lower the risk of dropped datagrams when many
        // lookups complete in the same tick
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_send_buffer_size(buffer_size)?;

        let socket: UdpSocket = socket.into();
        let monitor = Rc::new(UdpMonitor(self.self_ref.clone()));
        self.registration = Some(self.reactor.add(
            socket.as_raw_fd(),
            Interest::Readable,
            monitor,
        )?);
        self.socket = Some(socket);

        debug!("opened {:?} datagram socket", self.family);
        Ok(())
    }

    /// Register interest in responses from `peer` carrying `id`
    pub(crate) fn subscribe(&mut self, lookup: Weak<Lookup>, peer: IpAddr, id: u16) {
        self.subscriptions.entry((peer, id)).or_default().push(lookup);
    }

    /// Drop a previously registered interest
    pub(crate) fn unsubscribe(&mut self, lookup: &Weak<Lookup>, peer: IpAddr, id: u16) {
        if let Some(subscribers) = self.subscriptions.get_mut(&(peer, id)) {
            subscribers.retain(|subscriber| !subscriber.ptr_eq(lookup));
            if subscribers.is_empty() {
                self.subscriptions.remove(&(peer, id));
            }
        }
    }

    /// Readable callback: drain the kernel, then ping the scheduler so it
    /// arms an immediate tick. No lookup code runs here.
    fn on_readable(this: &Rc<RefCell<Self>>) {
        let mut guard = this.borrow_mut();
        let transport = &mut *guard;
        let Some(socket) = transport.socket.as_ref() else {
            return;
        };

        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
        let mut drained = 0usize;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    trace!("buffered {} bytes from {}", len, peer);
                    let message = buf[..len].to_vec();
                    transport.responses.push_back((peer.ip(), message));
                    drained += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("error receiving on {:?} socket: {}", transport.family, e);
                    break;
                }
            }
        }

        if drained == 0 {
            return;
        }
        let core = transport.core.clone();
        drop(guard);

        if let Some(core) = core.upgrade() {
            core.borrow_mut().on_buffered();
        }
    }

    /// Dispatch up to `max` buffered responses to their subscribers and
    /// return how many buffer entries were consumed.
    ///
    /// Subscribers run user handlers, so the transport borrow is released
    /// around every dispatch: a handler may cancel other lookups, which
    /// unsubscribes them right here.
    pub(crate) fn deliver(this: &Rc<RefCell<Self>>, max: usize) -> usize {
        let mut consumed = 0;

        while consumed < max {
            let Some((peer, bytes)) = this.borrow_mut().responses.pop_front() else {
                break;
            };
            consumed += 1;

            let response = match Response::from_vec(bytes) {
                Ok(response) => response,
                Err(e) => {
                    warn!("dropping undecodable response from {}: {}", peer, e);
                    continue;
                }
            };

            let subscribers = this
                .borrow()
                .subscriptions
                .get(&(peer, response.id()))
                .cloned();
            let Some(subscribers) = subscribers else {
                debug!("unexpected response id {} from {}", response.id(), peer);
                continue;
            };

            for subscriber in subscribers {
                if let Some(lookup) = subscriber.upgrade() {
                    if Lookup::on_udp_response(&lookup, peer, response.clone()) {
                        break;
                    }
                }
            }
        }

        consumed
    }

    /// Close the socket. Idempotent; safe whenever no further replies are
    /// expected. The next send reopens it.
    pub(crate) fn close(&mut self) {
        if let (Some(registration), Some(socket)) = (self.registration.take(), self.socket.take()) {
            if let Err(e) = self.reactor.remove(registration, socket.as_raw_fd()) {
                warn!("failed to deregister {:?} socket: {}", self.family, e);
            }
            debug!("closed {:?} datagram socket", self.family);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
