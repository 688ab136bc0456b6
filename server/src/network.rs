//! UDP multicast transmission of song datagrams.
//!
//! Wraps a tokio UDP socket configured through `socket2` for link-local
//! multicast (TTL 1, loopback enabled so a client on the same host hears
//! the stream).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};
use wss_common::{ControlMessage, Datagram};

/// Sender for audio datagrams and control frames.
///
/// Network errors on individual sends are logged and do not stop the
/// stream; datagrams lost this way are recovered like any other loss.
pub struct MulticastSender {
    // ---
    socket: UdpSocket,
    dest: SocketAddr,
    packets_sent: u64,
    bytes_sent: u64,
}

impl MulticastSender {
    // ---
    /// Creates a sender for the multicast group `group`.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be created or configured.
    pub fn new(group: SocketAddrV4) -> Result<Self> {
        // ---
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create multicast socket")?;
        socket
            .set_multicast_ttl_v4(1)
            .context("failed to set multicast TTL")?;
        socket
            .set_multicast_loop_v4(true)
            .context("failed to enable multicast loopback")?;

        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket
            .bind(&bind.into())
            .context("failed to bind multicast socket")?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!("Multicast socket bound to {}", socket.local_addr()?);

        Ok(Self::from_socket(socket, SocketAddr::V4(group)))
    }

    /// Creates a sender on an already-bound socket, sending to `dest`.
    ///
    /// Lets tests stream over plain loopback unicast.
    pub fn from_socket(socket: UdpSocket, dest: SocketAddr) -> Self {
        // ---
        Self {
            socket,
            dest,
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }

    /// Encodes and sends one datagram.
    ///
    /// # Errors
    ///
    /// Returns error only if the datagram cannot be encoded.
    pub async fn send_datagram(&mut self, datagram: &Datagram) -> Result<()> {
        // ---
        let data = datagram
            .encode()
            .with_context(|| format!("failed to encode datagram {}", datagram.sequence))?;

        self.send_raw(&data, datagram.sequence).await;
        Ok(())
    }

    /// Sends a fixed-size control frame.
    ///
    /// # Errors
    ///
    /// Returns error if the control token does not fit a frame.
    pub async fn send_control(&mut self, message: &ControlMessage) -> Result<()> {
        // ---
        let frame = message
            .encode_frame()
            .with_context(|| format!("failed to frame control message {message}"))?;

        debug!("Sending control {}", message);
        self.send_raw(&frame, 0).await;
        Ok(())
    }

    async fn send_raw(&mut self, data: &[u8], sequence: u32) {
        // ---
        match self.socket.send_to(data, self.dest).await {
            Ok(bytes) => {
                self.packets_sent += 1;
                self.bytes_sent += bytes as u64;

                if self.packets_sent % 100 == 0 {
                    debug!(
                        "Sent {} packets ({} bytes) - seq={}",
                        self.packets_sent, self.bytes_sent, sequence
                    );
                }
            }
            Err(e) => {
                error!("Failed to send packet seq={} to {}: {}", sequence, self.dest, e);
                warn!("Continuing despite network error");
            }
        }
    }

    /// Returns (packets_sent, bytes_sent).
    pub fn stats(&self) -> (u64, u64) {
        (self.packets_sent, self.bytes_sent)
    }
}
