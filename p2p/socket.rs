//! The `DatagramTransport` trait seam over a raw UDP socket, per §6 ("Consumed: raw UDP
//! socket"). Lets the session layer be driven by a real `tokio::net::UdpSocket` in a host
//! binary or an in-memory channel pair in tests, the same way the teacher threads an
//! `Arc<UdpSocket>` into `DiscoveryServerState`/`DiscoverySideCarState`.

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::discv5::codec::DISCOVERY_MAX_PACKET_SIZE;
use crate::error::Result;

#[async_trait::async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> Result<SocketAddr>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait::async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(buf, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// A fixed scratch buffer sized for the largest legal discv5 datagram, reused across
/// `recv_from` calls by whichever task owns the socket loop.
pub fn new_recv_buffer() -> Vec<u8> {
    vec![0u8; DISCOVERY_MAX_PACKET_SIZE]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_send_recv_round_trips() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).await.unwrap();
        let mut buf = new_recv_buffer();
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
