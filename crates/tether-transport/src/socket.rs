//! # Datagram Sockets
//!
//! The host talks to the network through the [`Socket`] trait: non-blocking
//! send and receive plus a bounded readiness wait. [`UdpTransport`] is the
//! real implementation; [`crate::sim`] provides an in-memory one for tests.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Type};

/// Datagram transport driven by the host service loop.
pub trait Socket {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send one datagram. Returns the number of bytes written, 0 if the
    /// send would block.
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram without blocking. `Ok(None)` when nothing is
    /// queued.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Block until a datagram is readable or `timeout` elapses. Returns
    /// whether the socket became readable.
    fn wait(&mut self, timeout: Duration) -> io::Result<bool>;
}

// ─── UDP ────────────────────────────────────────────────────────────────────

/// A bound UDP socket with tuned buffer sizes.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `addr`, enabling broadcast and applying the requested kernel
    /// buffer sizes. Sizes of 0 keep the system default.
    pub fn bind(
        addr: SocketAddr,
        receive_buffer_size: usize,
        send_buffer_size: usize,
    ) -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        } else {
            socket.set_broadcast(true)?;
        }
        if receive_buffer_size > 0 {
            socket.set_recv_buffer_size(receive_buffer_size)?;
        }
        if send_buffer_size > 0 {
            socket.set_send_buffer_size(send_buffer_size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        Ok(UdpTransport {
            socket: socket.into(),
        })
    }

    pub fn from_std(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(UdpTransport { socket })
    }
}

impl Socket for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // A previous send hit an ICMP port-unreachable; not fatal.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        if timeout.is_zero() {
            return peek_readable(self.socket.peek_from(&mut probe));
        }

        // The read timeout is only honoured in blocking mode. Set it first so
        // a failure leaves the socket non-blocking.
        self.socket.set_read_timeout(Some(timeout))?;
        self.socket.set_nonblocking(false)?;
        let readable = peek_readable(self.socket.peek_from(&mut probe));
        let restored = self.socket.set_nonblocking(true);
        let readable = readable?;
        restored?;
        Ok(readable)
    }
}

#[cfg(windows)]
const WSAEMSGSIZE: i32 = 10040;

/// Map the outcome of a 1-byte peek onto readiness. Errors that the next
/// `recv_from` absorbs still mean something is waiting.
fn peek_readable(result: io::Result<(usize, SocketAddr)>) -> io::Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(false)
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(true),
        #[cfg(windows)]
        Err(e) if e.raw_os_error() == Some(WSAEMSGSIZE) => Ok(true),
        Err(e) => Err(e),
    }
}
