//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! whole datagrams.  All protocol logic lives elsewhere; this module owns
//! only byte I/O.  [`DatagramSocket`] is the seam the link binds through.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Largest datagram the drone sends (state broadcasts are well under 200
/// bytes; command replies are shorter still).
const MAX_DATAGRAM: usize = 2048;

/// What the link needs from a bound datagram socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync + Sized + 'static {
    async fn bind(local_addr: SocketAddr) -> io::Result<Self>;

    fn local_addr(&self) -> SocketAddr;

    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()>;

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)>;
}

/// An async, datagram-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared between the link and
/// its listener task.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send `payload` as a single UDP datagram to `dest`.
    ///
    /// Resolves once the OS has accepted the datagram.
    pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send_to(payload, dest).await?;
        Ok(())
    }

    /// Receive the next datagram.
    ///
    /// Returns `(payload, sender_address)`.
    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }
}

#[async_trait]
impl DatagramSocket for Socket {
    async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        Socket::bind(local_addr).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        Socket::send_to(self, payload, dest).await
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        Socket::recv_from(self).await
    }
}
