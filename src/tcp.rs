// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot TCP fallback for truncated responses.
//!
//! When a UDP answer arrives with the TC bit set, the lookup opens a
//! [`TcpConnection`] to the same nameserver, re-issues the query with the
//! RFC 1035 two-byte length prefix, and reads one length-prefixed response.
//! If anything goes wrong the stashed truncated UDP response is surfaced
//! instead: a cut-off answer beats no answer.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, warn};

use crate::lookup::Lookup;
use crate::op::{Query, Response};
use crate::reactor::{Interest, Monitor, Reactor, RegistrationId};

pub(crate) struct TcpConnection {
    reactor: Rc<dyn Reactor>,
    owner: Weak<Lookup>,
    stream: Option<TcpStream>,
    registration: Option<RegistrationId>,
    state: State,
    /// length prefix + query bytes
    request: Vec<u8>,
    written: usize,
    length: [u8; 2],
    length_read: usize,
    body: Vec<u8>,
    body_read: usize,
    /// the UDP response that triggered this connection
    truncated: Option<Response>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Sending,
    ReadingLength,
    ReadingBody,
    Done,
}

/// What one round of state-machine progress decided
enum Outcome {
    Pending,
    Complete(Response),
    Failed,
}

/// Reactor-facing callback shim
struct TcpMonitor(Weak<RefCell<TcpConnection>>);

impl Monitor for TcpMonitor {
    fn notify(&self) {
        if let Some(connection) = self.0.upgrade() {
            TcpConnection::advance(&connection);
        }
    }

    // only armed when the connection failed at construction
    fn expire(&self) {
        if let Some(connection) = self.0.upgrade() {
            TcpConnection::advance(&connection);
        }
    }
}

impl TcpConnection {
    /// Connect to `ip:port` and take over the lookup's query. `truncated`
    /// is the UDP response being retried; it comes back to the owner if the
    /// stream attempt fails.
    pub(crate) fn new(
        reactor: Rc<dyn Reactor>,
        ip: IpAddr,
        port: u16,
        query: &Query,
        truncated: Response,
        owner: Weak<Lookup>,
    ) -> Rc<RefCell<Self>> {
        let mut request = Vec::with_capacity(2 + query.bytes().len());
        request.extend_from_slice(&(query.bytes().len() as u16).to_be_bytes());
        request.extend_from_slice(query.bytes());

        let this = Rc::new_cyclic(|self_ref: &Weak<RefCell<Self>>| {
            RefCell::new(Self {
                reactor: reactor.clone(),
                owner,
                stream: None,
                registration: None,
                state: State::Connecting,
                request,
                written: 0,
                length: [0; 2],
                length_read: 0,
                body: Vec::new(),
                body_read: 0,
                truncated: Some(truncated),
            })
        });

        let monitor: Rc<dyn Monitor> = Rc::new(TcpMonitor(Rc::downgrade(&this)));
        let address = SocketAddr::new(ip, port);
        let result = TcpStream::connect(address).and_then(|stream| {
            let registration = reactor.add(stream.as_raw_fd(), Interest::ReadWrite, monitor.clone())?;
            let mut connection = this.borrow_mut();
            connection.stream = Some(stream);
            connection.registration = Some(registration);
            Ok(())
        });
        if let Err(e) = result {
            warn!("tcp connect to {} failed: {}", address, e);
            // the owner is mid-construction; report the failure next tick
            reactor.timer(Duration::ZERO, monitor);
        } else {
            debug!("retrying query over tcp to {}", address);
        }

        this
    }

    /// Drive the state machine as far as the socket allows, then report a
    /// final outcome to the owning lookup. Outcomes are dispatched with the
    /// connection borrow released: the owner drops us from inside the call.
    fn advance(this: &Rc<RefCell<Self>>) {
        let (outcome, truncated) = {
            let mut guard = this.borrow_mut();
            if guard.state == State::Done {
                return;
            }
            let outcome = guard.poll_io();
            match outcome {
                Outcome::Pending => return,
                _ => {
                    guard.finish();
                    (outcome, guard.truncated.take())
                }
            }
        };

        let Some(lookup) = this.borrow().owner.upgrade() else {
            return;
        };
        match (outcome, truncated) {
            (Outcome::Complete(response), _) => Lookup::on_tcp_response(&lookup, response),
            (_, Some(truncated)) => Lookup::on_tcp_failure(&lookup, truncated),
            _ => {}
        }
    }

    fn poll_io(&mut self) -> Outcome {
        let Some(stream) = self.stream.as_mut() else {
            // construction never got a socket
            return Outcome::Failed;
        };

        loop {
            match self.state {
                State::Connecting => {
                    // a failed nonblocking connect parks its error on the
                    // socket; peer_addr alone would report NotConnected
                    // forever
                    match stream.take_error() {
                        Ok(None) => {}
                        Ok(Some(e)) => {
                            debug!("tcp connect failed: {}", e);
                            return Outcome::Failed;
                        }
                        Err(e) => {
                            debug!("tcp connect failed: {}", e);
                            return Outcome::Failed;
                        }
                    }
                    match stream.peer_addr() {
                        Ok(_) => self.state = State::Sending,
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            return Outcome::Pending
                        }
                        Err(e) => {
                            debug!("tcp connect failed: {}", e);
                            return Outcome::Failed;
                        }
                    }
                }

                State::Sending => match stream.write(&self.request[self.written..]) {
                    Ok(0) => return Outcome::Failed,
                    Ok(n) => {
                        self.written += n;
                        if self.written == self.request.len() {
                            self.state = State::ReadingLength;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Pending,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("tcp send failed: {}", e);
                        return Outcome::Failed;
                    }
                },

                State::ReadingLength => {
                    let length_read = self.length_read;
                    match stream.read(&mut self.length[length_read..]) {
                        Ok(0) => return Outcome::Failed,
                        Ok(n) => {
                            self.length_read += n;
                            if self.length_read == 2 {
                                let length = usize::from(u16::from_be_bytes(self.length));
                                if length == 0 {
                                    return Outcome::Failed;
                                }
                                self.body = vec![0; length];
                                self.state = State::ReadingBody;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Pending,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!("tcp receive failed: {}", e);
                            return Outcome::Failed;
                        }
                    }
                }

                State::ReadingBody => {
                    let body_read = self.body_read;
                    match stream.read(&mut self.body[body_read..]) {
                        Ok(0) => return Outcome::Failed,
                        Ok(n) => {
                            self.body_read += n;
                            if self.body_read == self.body.len() {
                                return match Response::from_vec(std::mem::take(&mut self.body)) {
                                    Ok(response) => Outcome::Complete(response),
                                    Err(e) => {
                                        debug!("undecodable tcp response: {}", e);
                                        Outcome::Failed
                                    }
                                };
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Pending,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!("tcp receive failed: {}", e);
                            return Outcome::Failed;
                        }
                    }
                }

                State::Done => return Outcome::Pending,
            }
        }
    }

    /// Deregister and close the stream; idempotent
    fn finish(&mut self) {
        self.state = State::Done;
        if let (Some(registration), Some(stream)) = (self.registration.take(), self.stream.take()) {
            if let Err(e) = self.reactor.remove(registration, stream.as_raw_fd()) {
                warn!("failed to deregister tcp stream: {}", e);
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.finish();
    }
}
