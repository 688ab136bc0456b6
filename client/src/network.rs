//! UDP multicast reception of song datagrams.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::info;
use wss_common::MAX_DATAGRAM_SIZE;

/// Receive buffer size. Anything longer than a full datagram is truncated
/// and then rejected by the codec.
const RECV_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE + 64;

/// Multicast group member receiving raw datagrams.
pub struct MulticastReceiver {
    // ---
    socket: UdpSocket,
    buf: Vec<u8>,
    packets_received: u64,
    bytes_received: u64,
}

impl MulticastReceiver {
    // ---
    /// Joins `group` on all interfaces.
    ///
    /// The port is bound with address reuse so several clients on one host
    /// can listen to the same stream.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound or the group joined.
    pub fn join(group: SocketAddrV4) -> Result<Self> {
        // ---
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create multicast socket")?;
        socket
            .set_reuse_address(true)
            .context("failed to set SO_REUSEADDR")?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .context("failed to set SO_REUSEPORT")?;

        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        socket
            .bind(&bind.into())
            .with_context(|| format!("failed to bind {}", bind))?;
        socket
            .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("failed to join multicast group {}", group.ip()))?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("Joined multicast group {}", group);

        Ok(Self::from_socket(socket))
    }

    /// Receives on an already-bound socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        // ---
        Self {
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            packets_received: 0,
            bytes_received: 0,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits for the next datagram and returns its bytes.
    ///
    /// Cancel safe: dropping the future loses no datagram.
    ///
    /// # Errors
    ///
    /// Returns error if the socket receive fails.
    pub async fn recv(&mut self) -> Result<&[u8]> {
        // ---
        let len = self
            .socket
            .recv(&mut self.buf)
            .await
            .context("failed to receive datagram")?;

        self.packets_received += 1;
        self.bytes_received += len as u64;
        Ok(&self.buf[..len])
    }

    /// Returns `(packets_received, bytes_received)`.
    pub fn stats(&self) -> (u64, u64) {
        (self.packets_received, self.bytes_received)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_receives_raw_bytes() {
        // ---
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let mut receiver = MulticastReceiver::from_socket(socket);
        let addr = receiver.local_addr().expect("addr");

        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        sender.send_to(b"payload", addr).await.expect("send");

        let data = receiver.recv().await.expect("recv").to_vec();
        assert_eq!(data, b"payload");
        assert_eq!(receiver.stats(), (1, 7));
    }
}
