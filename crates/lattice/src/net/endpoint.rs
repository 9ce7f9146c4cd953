use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::packet::MAX_PACKET_SIZE;

/// Datagram transport seam. Sessions are generic over this so they run
/// identically over a real socket or the in-memory link simulator.
pub trait Transport {
    fn local_addr(&self) -> SocketAddr;

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Non-blocking receive: `Ok(None)` when nothing is queued.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Non-blocking UDP socket transport.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        debug_assert!(data.len() <= MAX_PACKET_SIZE);
        self.socket.send_to(data, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => Ok(Some((size, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // A previous send to a dead peer surfaces here on some
            // platforms; treat it as "nothing received" and let the
            // timeout machinery deal with the peer.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }
}
