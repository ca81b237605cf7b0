use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

/// Opaque identifier for one socket owned by a transport. Handles are never
/// reused within a transport's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Injectable socket layer. All operations are non-blocking: reads and writes
/// return partial counts or `WouldBlock`, and `open_tcp` starts a connect
/// without waiting for it to complete.
pub trait Transport {
    fn open_udp(&mut self, server: SocketAddr) -> io::Result<SocketHandle>;
    fn open_tcp(&mut self, server: SocketAddr) -> io::Result<SocketHandle>;
    fn send(&mut self, socket: SocketHandle, buf: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<usize>;
    fn recv_from(&mut self, socket: SocketHandle, buf: &mut [u8])
    -> io::Result<(usize, SocketAddr)>;
    fn close(&mut self, socket: SocketHandle);
}

/// True for the transient not-ready errors that mean "try again later".
pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

enum SysSocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// Default [`Transport`] over the operating system's sockets.
#[derive(Default)]
pub struct SysTransport {
    sockets: FxHashMap<SocketHandle, SysSocket>,
    next_handle: u64,
}

impl SysTransport {
    pub fn new() -> SysTransport {
        SysTransport::default()
    }

    fn register(&mut self, socket: SysSocket) -> SocketHandle {
        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        self.sockets.insert(handle, socket);
        handle
    }

    fn get(&mut self, handle: SocketHandle) -> io::Result<&mut SysSocket> {
        self.sockets
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }

    /// Raw file descriptor backing a handle, for readiness integration.
    #[cfg(unix)]
    pub fn raw_fd(&self, handle: SocketHandle) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.sockets.get(&handle).map(|s| match s {
            SysSocket::Udp(s) => s.as_raw_fd(),
            SysSocket::Tcp(s) => s.as_raw_fd(),
        })
    }
}

impl Transport for SysTransport {
    fn open_udp(&mut self, server: SocketAddr) -> io::Result<SocketHandle> {
        let socket = Socket::new(Domain::for_address(server), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        // Connect so ICMP errors surface as send/recv failures.
        socket.connect(&server.into())?;
        let handle = self.register(SysSocket::Udp(socket.into()));
        trace!("opened udp {} to {}", handle, server);
        Ok(handle)
    }

    fn open_tcp(&mut self, server: SocketAddr) -> io::Result<SocketHandle> {
        let socket = Socket::new(Domain::for_address(server), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        match socket.connect(&server.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if would_block(&err) => {}
            Err(err) => return Err(err),
        }
        let handle = self.register(SysSocket::Tcp(socket.into()));
        trace!("opened tcp {} to {}", handle, server);
        Ok(handle)
    }

    fn send(&mut self, socket: SocketHandle, buf: &[u8]) -> io::Result<usize> {
        match self.get(socket)? {
            SysSocket::Udp(s) => s.send(buf),
            SysSocket::Tcp(s) => s.write(buf),
        }
    }

    fn recv(&mut self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<usize> {
        match self.get(socket)? {
            SysSocket::Udp(s) => s.recv(buf),
            SysSocket::Tcp(s) => s.read(buf),
        }
    }

    fn recv_from(
        &mut self,
        socket: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)> {
        match self.get(socket)? {
            SysSocket::Udp(s) => s.recv_from(buf),
            SysSocket::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv_from on a stream socket",
            )),
        }
    }

    fn close(&mut self, socket: SocketHandle) {
        if self.sockets.remove(&socket).is_some() {
            trace!("closed {}", socket);
        }
    }
}
