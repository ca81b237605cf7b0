//! Shared test harness: a scripted in-memory transport plus helpers for
//! building channels and DNS responses deterministically.

#![allow(dead_code)] // These helpers are used by various test files

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hermod::discovery::NoDiscovery;
use hermod::transport::{SocketHandle, Transport};
use hermod::{Channel, ChannelOptions, QueryCallback, QueryOutcome};

pub struct MockSocket {
    pub handle: SocketHandle,
    pub is_tcp: bool,
    pub peer: SocketAddr,
    pub open: bool,
    /// Datagrams (UDP) or write chunks (TCP) the channel sent.
    pub sent: Vec<Vec<u8>>,
    /// Scripted inbound data with its source address.
    pub rx: VecDeque<(Vec<u8>, SocketAddr)>,
    /// Cap on bytes accepted per send call, to exercise short writes.
    pub write_limit: Option<usize>,
    pub fail_sends: bool,
    pub fail_reads: bool,
    pub peer_closed: bool,
}

#[derive(Default)]
pub struct MockTransport {
    next_handle: u64,
    pub sockets: Vec<MockSocket>,
    pub refuse: Vec<SocketAddr>,
    /// Error kind every open fails with, when set.
    pub open_error: Option<io::ErrorKind>,
    /// Open attempts, including refused ones.
    pub open_attempts: usize,
    pub opens: usize,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    pub fn refuse(&mut self, addr: &str) {
        self.refuse.push(addr.parse().unwrap());
    }

    pub fn socket(&self, handle: SocketHandle) -> &MockSocket {
        self.sockets.iter().find(|s| s.handle == handle).expect("unknown handle")
    }

    pub fn socket_mut(&mut self, handle: SocketHandle) -> &mut MockSocket {
        self.sockets.iter_mut().find(|s| s.handle == handle).expect("unknown handle")
    }

    pub fn open_handles(&self) -> Vec<SocketHandle> {
        self.sockets.iter().filter(|s| s.open).map(|s| s.handle).collect()
    }

    /// The single open socket, asserting there is exactly one.
    pub fn only_handle(&self) -> SocketHandle {
        let handles = self.open_handles();
        assert_eq!(handles.len(), 1, "expected exactly one open socket");
        handles[0]
    }

    pub fn last_handle(&self) -> SocketHandle {
        self.sockets.last().expect("no sockets opened").handle
    }

    /// Queue an inbound UDP datagram from the socket's own peer.
    pub fn push_udp(&mut self, handle: SocketHandle, payload: &[u8]) {
        let peer = self.socket(handle).peer;
        self.socket_mut(handle).rx.push_back((payload.to_vec(), peer));
    }

    /// Queue an inbound UDP datagram from an arbitrary source address.
    pub fn push_udp_from(&mut self, handle: SocketHandle, payload: &[u8], from: &str) {
        let from: SocketAddr = from.parse().unwrap();
        self.socket_mut(handle).rx.push_back((payload.to_vec(), from));
    }

    /// Queue raw inbound TCP bytes (delivered as one read chunk).
    pub fn push_tcp(&mut self, handle: SocketHandle, bytes: &[u8]) {
        let peer = self.socket(handle).peer;
        self.socket_mut(handle).rx.push_back((bytes.to_vec(), peer));
    }

    fn open_socket(&mut self, server: SocketAddr, is_tcp: bool) -> io::Result<SocketHandle> {
        self.open_attempts += 1;
        if let Some(kind) = self.open_error {
            return Err(io::Error::new(kind, "open failure"));
        }
        if self.refuse.contains(&server) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        self.opens += 1;
        self.sockets.push(MockSocket {
            handle,
            is_tcp,
            peer: server,
            open: true,
            sent: Vec::new(),
            rx: VecDeque::new(),
            write_limit: None,
            fail_sends: false,
            fail_reads: false,
            peer_closed: false,
        });
        Ok(handle)
    }

    fn live(&mut self, handle: SocketHandle) -> io::Result<&mut MockSocket> {
        self.sockets
            .iter_mut()
            .find(|s| s.handle == handle && s.open)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }
}

impl Transport for MockTransport {
    fn open_udp(&mut self, server: SocketAddr) -> io::Result<SocketHandle> {
        self.open_socket(server, false)
    }

    fn open_tcp(&mut self, server: SocketAddr) -> io::Result<SocketHandle> {
        self.open_socket(server, true)
    }

    fn send(&mut self, socket: SocketHandle, buf: &[u8]) -> io::Result<usize> {
        let sock = self.live(socket)?;
        if sock.fail_sends {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send failure"));
        }
        let len = sock.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
        sock.sent.push(buf[..len].to_vec());
        Ok(len)
    }

    fn recv(&mut self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<usize> {
        let sock = self.live(socket)?;
        if sock.fail_reads {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "read failure"));
        }
        if let Some((chunk, from)) = sock.rx.pop_front() {
            let len = chunk.len().min(buf.len());
            buf[..len].copy_from_slice(&chunk[..len]);
            if len < chunk.len() {
                sock.rx.push_front((chunk[len..].to_vec(), from));
            }
            return Ok(len);
        }
        if sock.peer_closed {
            return Ok(0);
        }
        Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
    }

    fn recv_from(&mut self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let sock = self.live(socket)?;
        if sock.fail_reads {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "read failure"));
        }
        if let Some((datagram, from)) = sock.rx.pop_front() {
            let len = datagram.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram[..len]);
            return Ok((len, from));
        }
        Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
    }

    fn close(&mut self, socket: SocketHandle) {
        if let Some(sock) = self.sockets.iter_mut().find(|s| s.handle == socket) {
            sock.open = false;
        }
    }
}

/// Build a channel over the mock transport with a fixed id seed and a short
/// default timeout.
pub fn mock_channel(
    servers: &[&str],
    tweak: impl FnOnce(&mut ChannelOptions),
) -> Channel<MockTransport> {
    let mut options = ChannelOptions {
        servers: Some(servers.iter().map(|s| s.parse().unwrap()).collect()),
        timeout: Some(Duration::from_millis(100)),
        query_id_seed: Some(0xda7a),
        ..Default::default()
    };
    tweak(&mut options);
    Channel::with_transport(options, &NoDiscovery, MockTransport::new()).unwrap()
}

pub type Outcomes = Rc<RefCell<Vec<QueryOutcome>>>;

pub fn outcomes() -> Outcomes {
    Rc::new(RefCell::new(Vec::new()))
}

/// Callback that appends its outcome to the shared recording.
pub fn record(outcomes: &Outcomes) -> QueryCallback<MockTransport> {
    let outcomes = Rc::clone(outcomes);
    Box::new(move |_, outcome| outcomes.borrow_mut().push(outcome))
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

pub fn at(base: Instant, offset_ms: u64) -> Instant {
    base + ms(offset_ms)
}

/// Knobs for scripted responses.
pub struct ResponseSpec {
    pub rcode: u8,
    pub tc: bool,
    pub with_opt: bool,
    pub answers: u16,
}

impl Default for ResponseSpec {
    fn default() -> Self {
        ResponseSpec { rcode: 0, tc: false, with_opt: true, answers: 1 }
    }
}

/// Offset just past the (single, uncompressed) question of a request payload.
fn question_end(payload: &[u8]) -> usize {
    let mut off = 12;
    while payload[off] != 0 {
        off += 1 + payload[off] as usize;
    }
    off + 1 + 4
}

/// Build a response matching the given request payload: same id, question
/// echoed, header flags and counts taken from the knobs.
pub fn build_response(request: &[u8], spec: &ResponseSpec) -> Vec<u8> {
    let qend = question_end(request);
    let mut flags: u16 = 0x8000 | 0x0100 | (spec.rcode as u16 & 0x0f);
    if spec.tc {
        flags |= 0x0200;
    }
    let mut resp = Vec::new();
    resp.extend_from_slice(&request[..2]);
    resp.extend_from_slice(&flags.to_be_bytes());
    resp.extend_from_slice(&1u16.to_be_bytes());
    resp.extend_from_slice(&spec.answers.to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes());
    resp.extend_from_slice(&(spec.with_opt as u16).to_be_bytes());
    resp.extend_from_slice(&request[12..qend]);
    for _ in 0..spec.answers {
        resp.extend_from_slice(&[0xc0, 0x0c]); // name: pointer to the question
        resp.extend_from_slice(&1u16.to_be_bytes()); // type A
        resp.extend_from_slice(&1u16.to_be_bytes()); // class IN
        resp.extend_from_slice(&60u32.to_be_bytes()); // ttl
        resp.extend_from_slice(&4u16.to_be_bytes()); // rdlength
        resp.extend_from_slice(&[192, 0, 2, 1]);
    }
    if spec.with_opt {
        resp.push(0); // root name
        resp.extend_from_slice(&41u16.to_be_bytes());
        resp.extend_from_slice(&1232u16.to_be_bytes());
        resp.extend_from_slice(&0u32.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
    }
    resp
}

/// Length-prefix a response for delivery over the mock TCP stream.
pub fn tcp_frame(response: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + response.len());
    framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
    framed.extend_from_slice(response);
    framed
}
