use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Non-blocking datagram primitive the client sends and receives through.
pub trait DatagramTransport: Send {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Returns `Ok(None)` when nothing is pending.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// One non-blocking UDP socket per address family, each bound to an
/// ephemeral local port.
pub struct UdpTransport {
    socket: UdpSocket,
    socket6: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn bind() -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let socket6 = match UdpSocket::bind("[::]:0") {
            Ok(socket6) => {
                socket6.set_nonblocking(true)?;
                Some(socket6)
            }
            Err(e) => {
                log::warn!("IPv6 socket unavailable: {}", e);
                None
            }
        };

        Ok(Self { socket, socket6 })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn local_addr6(&self) -> Option<SocketAddr> {
        self.socket6.as_ref().and_then(|s| s.local_addr().ok())
    }
}

fn recv_nonblocking(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<(usize, SocketAddr)>> {
    match socket.recv_from(buf) {
        Ok(received) => Ok(Some(received)),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        // A previous send hit a closed port; not a reason to stop draining.
        Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
        Err(e) => Err(e),
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match (addr, &self.socket6) {
            (SocketAddr::V6(_), Some(socket6)) => socket6.send_to(data, addr),
            (SocketAddr::V6(_), None) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no IPv6 socket available",
            )),
            (SocketAddr::V4(_), _) => self.socket.send_to(data, addr),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        if let Some(received) = recv_nonblocking(&self.socket, buf)? {
            return Ok(Some(received));
        }
        match &self.socket6 {
            Some(socket6) => recv_nonblocking(socket6, buf),
            None => Ok(None),
        }
    }
}
