use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

#[cfg(test)]
use mockall::automock;

/// The raw datagram I/O of the ARQ transport, introduced to facilitate mocking the socket away
///  for testing. Implementations must be non-blocking.
#[cfg_attr(test, automock)]
pub trait DatagramSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
    /// the descriptor that is registered with the event loop
    fn raw_fd(&self) -> RawFd;
}

impl DatagramSocket for mio::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        mio::net::UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        mio::net::UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        mio::net::UdpSocket::local_addr(self)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}
