// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end lookup scenarios against in-process mock nameservers.
//!
//! The mocks are plain nonblocking sockets registered on the same reactor
//! that drives the resolver, so every test is a single-threaded, (mostly)
//! deterministic exchange of real datagrams over loopback.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use stub_resolv::{
    Hosts, Interest, Monitor, Operation, PollReactor, Reactor, RecordType, Resolver,
    ResolverConfig, ResolverOpts, Response, ResponseCode,
};

/// What a mock server does with an incoming query
#[derive(Clone, Copy)]
struct Behavior {
    /// swallow this many queries before answering
    drop_first: usize,
    /// set the TC bit on answers
    truncate: bool,
    /// answer rcode
    rcode: u8,
    /// never answer at all
    silent: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            drop_first: 0,
            truncate: false,
            rcode: 0,
            silent: false,
        }
    }
}

/// A mock UDP nameserver: echoes each query back as a response, with the
/// behavior's flag tweaks applied. RA is always set so tests can tell
/// mock answers apart from synthesized ones.
struct MockUdpServer {
    socket: UdpSocket,
    behavior: Cell<Behavior>,
    hits: Cell<usize>,
}

impl MockUdpServer {
    fn start(reactor: &Rc<PollReactor>, addr: SocketAddr, behavior: Behavior) -> Rc<Self> {
        let socket = UdpSocket::bind(addr).expect("bind mock udp server");
        socket.set_nonblocking(true).unwrap();

        let server = Rc::new(Self {
            socket,
            behavior: Cell::new(behavior),
            hits: Cell::new(0),
        });
        reactor
            .add(server.socket.as_raw_fd(), Interest::Readable, server.clone())
            .expect("register mock udp server");
        server
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn hits(&self) -> usize {
        self.hits.get()
    }
}

impl Monitor for MockUdpServer {
    fn notify(&self) {
        let mut buf = [0u8; 4096];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => panic!("mock server recv error: {e}"),
            };
            self.hits.set(self.hits.get() + 1);

            let mut behavior = self.behavior.get();
            if behavior.silent {
                continue;
            }
            if behavior.drop_first > 0 {
                behavior.drop_first -= 1;
                self.behavior.set(behavior);
                continue;
            }

            // echo the query as a response: QR + RA, rcode, maybe TC
            let mut response = buf[..len].to_vec();
            response[2] |= 0x80;
            if behavior.truncate {
                response[2] |= 0x02;
            }
            response[3] |= 0x80 | (behavior.rcode & 0x0F);
            self.socket.send_to(&response, from).unwrap();
        }
    }
}

/// A mock TCP nameserver: reads one length-prefixed query per connection
/// and echoes it back, QR and RA set, TC cleared.
///
/// Fully event-driven: blocking here would stall the reactor that the
/// resolver needs in order to send the very request being waited for.
struct MockTcpServer {
    reactor: Rc<PollReactor>,
    listener: TcpListener,
    hits: Cell<usize>,
}

impl MockTcpServer {
    fn start(reactor: &Rc<PollReactor>, addr: SocketAddr) -> Rc<Self> {
        let listener = TcpListener::bind(addr).expect("bind mock tcp server");
        listener.set_nonblocking(true).unwrap();

        let server = Rc::new(Self {
            reactor: reactor.clone(),
            listener,
            hits: Cell::new(0),
        });
        reactor
            .add(server.listener.as_raw_fd(), Interest::Readable, server.clone())
            .expect("register mock tcp server");
        server
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    fn hits(&self) -> usize {
        self.hits.get()
    }
}

impl Monitor for MockTcpServer {
    fn notify(&self) {
        loop {
            let (stream, _) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => panic!("mock server accept error: {e}"),
            };
            self.hits.set(self.hits.get() + 1);
            stream.set_nonblocking(true).unwrap();

            let conn = Rc::new(MockTcpConn {
                reactor: self.reactor.clone(),
                stream: RefCell::new(stream),
                buf: RefCell::new(Vec::new()),
                registration: Cell::new(None),
            });
            let fd = conn.stream.borrow().as_raw_fd();
            let id = self
                .reactor
                .add(fd, Interest::Readable, conn.clone())
                .unwrap();
            conn.registration.set(Some(id));
            // the request may already be buffered; no edge would follow
            conn.notify();
        }
    }
}

/// One accepted connection of the mock TCP server
struct MockTcpConn {
    reactor: Rc<PollReactor>,
    stream: RefCell<std::net::TcpStream>,
    buf: RefCell<Vec<u8>>,
    registration: Cell<Option<stub_resolv::RegistrationId>>,
}

impl Monitor for MockTcpConn {
    fn notify(&self) {
        let mut stream = self.stream.borrow_mut();
        let mut buf = self.buf.borrow_mut();

        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("mock server read error: {e}"),
            }
        }

        if buf.len() < 2 {
            return;
        }
        let length = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
        if buf.len() < 2 + length {
            return;
        }

        let mut response = buf[2..2 + length].to_vec();
        response[2] |= 0x80;
        response[2] &= !0x02;
        response[3] |= 0x80;

        stream.write_all(&buf[..2]).unwrap();
        stream.write_all(&response).unwrap();

        if let Some(id) = self.registration.take() {
            self.reactor.remove(id, stream.as_raw_fd()).unwrap();
        }
    }
}

/// Records every terminal callback a lookup produces
#[derive(Debug)]
enum Event {
    Received(Response),
    Timeout,
    Cancelled,
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
    /// cancelled from inside the received callback, if set
    cancel_on_receive: RefCell<Option<Operation>>,
}

impl Recorder {
    fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn len(&self) -> usize {
        self.events.borrow().len()
    }

    fn received(&self) -> Vec<Response> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Received(response) => Some(response.clone()),
                _ => None,
            })
            .collect()
    }

    fn timeouts(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| matches!(event, Event::Timeout))
            .count()
    }

    fn cancellations(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| matches!(event, Event::Cancelled))
            .count()
    }
}

impl stub_resolv::Handler for Recorder {
    fn on_received(&self, _op: &Operation, response: Response) {
        self.events.borrow_mut().push(Event::Received(response));
        if let Some(other) = self.cancel_on_receive.borrow_mut().take() {
            other.cancel();
        }
    }

    fn on_timeout(&self, _op: &Operation) {
        self.events.borrow_mut().push(Event::Timeout);
    }

    fn on_cancelled(&self, _op: &Operation) {
        self.events.borrow_mut().push(Event::Cancelled);
    }
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// `RUST_LOG=stub_resolv=trace cargo test` shows the scheduler at work
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn resolver_for(reactor: &Rc<PollReactor>, nameservers: Vec<IpAddr>, port: u16) -> Resolver {
    init_logging();
    let config = ResolverConfig::from_nameservers(nameservers);
    let resolver = Resolver::from_conf(reactor.clone(), config, ResolverOpts::default());
    resolver.set_port(port);
    resolver.set_timeout(Duration::from_millis(100));
    resolver.set_interval(Duration::from_millis(100));
    resolver
}

/// Drive the reactor until `done` or the deadline
fn run_until(reactor: &PollReactor, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() && Instant::now() < deadline {
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

/// A few extra turns to catch stray duplicate callbacks
fn settle(reactor: &PollReactor) {
    for _ in 0..20 {
        reactor.run_once(Some(Duration::from_millis(5))).unwrap();
    }
}

#[test]
fn happy_udp_lookup() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), Behavior::default());

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_capacity(10);
    resolver.set_attempts(1);
    resolver.set_timeout(Duration::from_secs(3));

    let recorder = Recorder::new();
    let op = resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    // nothing is delivered synchronously
    assert_eq!(recorder.len(), 0);

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(recorder.len(), 1);
    assert_eq!(Some(received[0].id()), op.id());
    assert_eq!(received[0].response_code(), ResponseCode::NoError);
    assert_eq!(server.hits(), 1);
}

#[test]
fn retry_until_a_server_answers() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let behavior = Behavior {
        drop_first: 2,
        ..Behavior::default()
    };
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), behavior);

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_attempts(3);

    let recorder = Recorder::new();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    assert_eq!(recorder.received().len(), 1);
    assert_eq!(recorder.len(), 1);
    assert_eq!(server.hits(), 3);
}

#[test]
fn exhausted_attempts_time_out() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let silent = Behavior {
        silent: true,
        ..Behavior::default()
    };
    // two nameservers on distinct loopback addresses, same port
    let first = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), silent);
    let second_ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    let second = MockUdpServer::start(&reactor, (second_ip, first.port()).into(), silent);

    let resolver = resolver_for(&reactor, vec![LOCALHOST, second_ip], first.port());
    resolver.set_attempts(2);
    resolver.set_rotate(false);

    let recorder = Recorder::new();
    let started = Instant::now();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    assert_eq!(recorder.timeouts(), 1);
    assert_eq!(recorder.len(), 1);
    // both attempts waited out their timeout
    assert!(started.elapsed() >= Duration::from_millis(150));
    // one attempt per server, in list order
    assert_eq!(first.hits(), 1);
    assert_eq!(second.hits(), 1);
}

#[test]
fn truncated_response_upgrades_to_tcp() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let tcp = MockTcpServer::start(&reactor, (LOCALHOST, 0).into());
    let truncating = Behavior {
        truncate: true,
        ..Behavior::default()
    };
    let udp = MockUdpServer::start(&reactor, (LOCALHOST, tcp.port()).into(), truncating);

    let resolver = resolver_for(&reactor, vec![LOCALHOST], udp.port());
    resolver.set_attempts(1);
    resolver.set_timeout(Duration::from_secs(2));

    let recorder = Recorder::new();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(recorder.len(), 1);
    // the full answer came over the stream, not the truncated datagram
    assert!(!received[0].truncated());
    assert_eq!(tcp.hits(), 1);
}

#[test]
fn failed_tcp_upgrade_surfaces_truncated_answer() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let truncating = Behavior {
        truncate: true,
        ..Behavior::default()
    };
    // no TCP listener: the upgrade is refused
    let udp = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), truncating);

    let resolver = resolver_for(&reactor, vec![LOCALHOST], udp.port());
    resolver.set_attempts(1);
    resolver.set_timeout(Duration::from_secs(2));

    let recorder = Recorder::new();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(recorder.len(), 1);
    // a cut-off answer beats no answer
    assert!(received[0].truncated());
}

#[test]
fn nxdomain_for_locally_listed_name_is_rewritten() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let nxdomain = Behavior {
        rcode: 3,
        ..Behavior::default()
    };
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), nxdomain);

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_hosts(
        Hosts::default()
            .read_hosts_conf("10.0.0.5 myhost".as_bytes())
            .unwrap(),
    );

    // an MX query is not answerable from the hosts file, so it goes to the
    // nameserver; the NXDOMAIN it returns must not leak through
    let recorder = Recorder::new();
    resolver
        .query("myhost", RecordType::MX, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].response_code(), ResponseCode::NoError);
    assert_eq!(received[0].answer_count(), 0);
}

#[test]
fn nxdomain_for_unlisted_name_is_delivered() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let nxdomain = Behavior {
        rcode: 3,
        ..Behavior::default()
    };
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), nxdomain);

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());

    let recorder = Recorder::new();
    resolver
        .query("nosuchname.example", RecordType::A, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].response_code(), ResponseCode::NXDomain);
}

#[test]
fn hosts_answers_are_delivered_in_a_later_tick() {
    let reactor = Rc::new(PollReactor::new().unwrap());

    // nameservers configured but never consulted
    let resolver = resolver_for(&reactor, vec![LOCALHOST], 65_000);
    resolver.set_hosts(
        Hosts::default()
            .read_hosts_conf("10.0.1.102 myhost".as_bytes())
            .unwrap(),
    );

    let recorder = Recorder::new();
    resolver
        .query("myhost", RecordType::A, recorder.clone())
        .unwrap();

    // never synchronously
    assert_eq!(recorder.len(), 0);

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(recorder.len(), 1);
    assert_eq!(
        received[0].addresses().unwrap(),
        vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 102))]
    );
}

#[test]
fn cancel_before_first_tick() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), Behavior::default());

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());

    let recorder = Recorder::new();
    let op = resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();
    op.cancel();

    // cancellation is synchronous and exactly-once
    assert_eq!(recorder.cancellations(), 1);
    op.cancel();
    assert_eq!(recorder.cancellations(), 1);

    settle(&reactor);

    // the query never went out, and nothing else was reported
    assert_eq!(server.hits(), 0);
    assert_eq!(recorder.len(), 1);
}

#[test]
fn cancel_other_lookup_from_inside_a_callback() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), Behavior::default());

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_timeout(Duration::from_secs(2));

    let first = Recorder::new();
    let second = Recorder::new();
    resolver
        .query("first.example.com", RecordType::A, first.clone())
        .unwrap();
    let second_op = resolver
        .query("second.example.com", RecordType::A, second.clone())
        .unwrap();

    // when the first response arrives, its handler cancels the second
    // lookup; the second lookup's buffered response must be dropped
    *first.cancel_on_receive.borrow_mut() = Some(second_op);

    run_until(&reactor, || first.len() > 0 && second.len() > 0);
    settle(&reactor);

    assert_eq!(first.received().len(), 1);
    assert_eq!(first.len(), 1);
    assert_eq!(second.cancellations(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(server.hits(), 2);
}

#[test]
fn capacity_bounds_concurrent_lookups() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), Behavior::default());

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_capacity(1);
    resolver.set_attempts(1);
    resolver.set_timeout(Duration::from_secs(2));

    let recorders: Vec<_> = (0..3).map(|_| Recorder::new()).collect();
    for (i, recorder) in recorders.iter().enumerate() {
        resolver
            .query(&format!("host{i}.example.com"), RecordType::A, recorder.clone())
            .unwrap();
    }

    run_until(&reactor, || recorders.iter().all(|r| r.len() > 0));
    settle(&reactor);

    for recorder in &recorders {
        assert_eq!(recorder.received().len(), 1);
        assert_eq!(recorder.len(), 1);
    }
    assert_eq!(server.hits(), 3);
}

#[test]
fn capacity_zero_parks_lookups_until_raised() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), Behavior::default());

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_capacity(0);
    resolver.set_attempts(1);
    resolver.set_timeout(Duration::from_secs(2));

    let recorder = Recorder::new();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    settle(&reactor);

    // nothing in flight, nothing on the wire, nothing reported
    assert_eq!(server.hits(), 0);
    assert_eq!(recorder.len(), 0);

    resolver.set_capacity(1);
    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    assert_eq!(recorder.received().len(), 1);
    assert_eq!(recorder.len(), 1);
    assert_eq!(server.hits(), 1);
}

#[test]
fn shutdown_cancels_outstanding_lookups() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let silent = Behavior {
        silent: true,
        ..Behavior::default()
    };
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), silent);

    let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
    resolver.set_timeout(Duration::from_secs(30));

    let recorder = Recorder::new();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    // let the first send go out, then tear everything down
    run_until(&reactor, || server.hits() > 0);
    resolver.shutdown();

    assert_eq!(recorder.cancellations(), 1);
    settle(&reactor);
    assert_eq!(recorder.len(), 1);
}

#[test]
fn dropping_the_resolver_is_silent() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let silent = Behavior {
        silent: true,
        ..Behavior::default()
    };
    let server = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), silent);

    let recorder = Recorder::new();
    {
        let resolver = resolver_for(&reactor, vec![LOCALHOST], server.port());
        resolver
            .query("example.com", RecordType::A, recorder.clone())
            .unwrap();
        run_until(&reactor, || server.hits() > 0);
    }

    settle(&reactor);
    assert_eq!(recorder.len(), 0);
}

#[test]
fn rotation_spreads_attempts_over_nameservers() {
    let reactor = Rc::new(PollReactor::new().unwrap());
    let silent = Behavior {
        silent: true,
        ..Behavior::default()
    };
    let first = MockUdpServer::start(&reactor, (LOCALHOST, 0).into(), silent);
    let second_ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3));
    let second = MockUdpServer::start(&reactor, (second_ip, first.port()).into(), silent);

    let resolver = resolver_for(&reactor, vec![LOCALHOST, second_ip], first.port());
    resolver.set_attempts(2);
    resolver.set_rotate(true);

    let recorder = Recorder::new();
    resolver
        .query("example.com", RecordType::A, recorder.clone())
        .unwrap();

    run_until(&reactor, || recorder.len() > 0);
    settle(&reactor);

    // whatever the random offset, two attempts over two servers land one
    // on each
    assert_eq!(recorder.timeouts(), 1);
    assert_eq!(first.hits() + second.hits(), 2);
    assert_eq!(first.hits(), 1);
    assert_eq!(second.hits(), 1);
}
