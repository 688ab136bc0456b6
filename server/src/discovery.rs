//! Server side of discovery: presence beacons, acknowledgement listener,
//! and peer expiry.
//!
//! Two loops run on their own tasks. The beacon loop broadcasts
//! `WSSServer` every tick and runs the expiry sweep on the same tick. The
//! acknowledgement loop waits for `WSSClient` tokens and upserts peers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use wss_common::{
    wait_or_stop, Config, DiscoveryToken, EventBus, MetricsContext, StopSignal, Wake, Worker,
    SERVER_BEACON,
};

use crate::registry::{Peer, PeerRegistry, Upsert};

/// Notifications fired by the discovery server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerJoined(Peer),
    PeerExpired(Peer),
}

/// Timing of the discovery loops.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverySettings {
    // ---
    /// Beacon and sweep period
    pub tick: Duration,

    /// Silence after which a peer is removed
    pub peer_timeout: Duration,

    /// Bounded wait of the acknowledgement receive
    pub read_timeout: Duration,

    /// Bounded join when stopping
    pub stop_timeout: Duration,
}

impl DiscoverySettings {
    pub fn from_config(config: &Config) -> Self {
        // ---
        Self {
            tick: config.beacon_interval(),
            peer_timeout: config.peer_timeout(),
            read_timeout: config.read_timeout(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

/// Applies acknowledgements and expiry to the registry and fires events.
#[derive(Clone)]
pub struct PeerTracker {
    // ---
    registry: Arc<PeerRegistry>,
    events: Arc<EventBus<DiscoveryEvent>>,
    metrics: Option<MetricsContext>,
    peer_timeout: Duration,
}

impl PeerTracker {
    // ---
    pub fn new(
        registry: Arc<PeerRegistry>,
        events: Arc<EventBus<DiscoveryEvent>>,
        metrics: Option<MetricsContext>,
        peer_timeout: Duration,
    ) -> Self {
        // ---
        Self {
            registry,
            events,
            metrics,
            peer_timeout,
        }
    }

    /// Records an acknowledgement from `address` received at `now`.
    pub fn on_ack(&self, address: IpAddr, now: Instant) {
        // ---
        if self.registry.upsert(address, now) == Upsert::Inserted {
            info!("Peer joined: {}", address);
            if let Some(peer) = self.registry.get(address) {
                self.events.publish(&DiscoveryEvent::PeerJoined(peer));
            }
        }
        self.update_gauge();
    }

    /// Removes silent peers and fires one expiry event per removed peer.
    pub fn sweep(&self, now: Instant) -> usize {
        // ---
        let expired = self.registry.expire(now, self.peer_timeout);
        for peer in &expired {
            info!("Peer expired: {} ({})", peer.display_name, peer.address);
            self.events.publish(&DiscoveryEvent::PeerExpired(peer.clone()));
        }
        self.update_gauge();
        expired.len()
    }

    fn update_gauge(&self) {
        // ---
        if let Some(m) = &self.metrics {
            m.peers_active.set(self.registry.len() as i64);
        }
    }
}

/// Running discovery server.
pub struct DiscoveryServer {
    // ---
    registry: Arc<PeerRegistry>,
    ack_addr: SocketAddr,
    beacon: Worker,
    ack: Worker,
    stop_timeout: Duration,
}

impl DiscoveryServer {
    // ---
    /// Binds the well-known sockets and starts both loops.
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgement port cannot be bound or the
    /// beacon socket cannot enable broadcast. Bind failures are not retried.
    pub async fn start(
        config: &Config,
        registry: Arc<PeerRegistry>,
        events: Arc<EventBus<DiscoveryEvent>>,
        metrics: Option<MetricsContext>,
    ) -> Result<Self> {
        // ---
        let ack_socket = UdpSocket::bind(("0.0.0.0", config.ack_port))
            .await
            .with_context(|| format!("failed to bind ack port {}", config.ack_port))?;

        let beacon_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind beacon socket")?;
        beacon_socket
            .set_broadcast(true)
            .context("failed to enable broadcast on beacon socket")?;

        let beacon_dest = SocketAddr::new(IpAddr::V4(config.broadcast_addr), config.discovery_port);

        Self::with_sockets(
            beacon_socket,
            beacon_dest,
            ack_socket,
            DiscoverySettings::from_config(config),
            registry,
            events,
            metrics,
        )
    }

    /// Starts both loops on already-bound sockets.
    pub fn with_sockets(
        beacon_socket: UdpSocket,
        beacon_dest: SocketAddr,
        ack_socket: UdpSocket,
        settings: DiscoverySettings,
        registry: Arc<PeerRegistry>,
        events: Arc<EventBus<DiscoveryEvent>>,
        metrics: Option<MetricsContext>,
    ) -> Result<Self> {
        // ---
        let ack_addr = ack_socket.local_addr()?;
        info!(
            "Discovery server: beacon -> {}, acks on {}",
            beacon_dest, ack_addr
        );

        let tracker = PeerTracker::new(
            Arc::clone(&registry),
            events,
            metrics,
            settings.peer_timeout,
        );

        let signal = StopSignal::new();

        let beacon = Worker::spawn(
            "discovery-beacon",
            signal.clone(),
            beacon_loop(
                beacon_socket,
                beacon_dest,
                settings.tick,
                tracker.clone(),
                signal.clone(),
            ),
        );

        let ack = Worker::spawn(
            "discovery-ack",
            signal.clone(),
            ack_loop(ack_socket, settings.read_timeout, tracker, signal),
        );

        Ok(Self {
            registry,
            ack_addr,
            beacon,
            ack,
            stop_timeout: settings.stop_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Address the acknowledgement loop is bound to.
    pub fn ack_addr(&self) -> SocketAddr {
        self.ack_addr
    }

    /// Stops both loops, waiting a bounded time for each.
    pub async fn stop(self) {
        // ---
        let Self {
            beacon,
            ack,
            stop_timeout,
            ..
        } = self;

        beacon.stop(stop_timeout).await;
        ack.stop(stop_timeout).await;
        info!("Discovery server stopped");
    }
}

async fn beacon_loop(
    socket: UdpSocket,
    dest: SocketAddr,
    tick: Duration,
    tracker: PeerTracker,
    signal: StopSignal,
) {
    // ---
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while signal.is_running() {
        match wait_or_stop(&signal, tick * 2, ticker.tick()).await {
            Wake::Stopped => break,
            Wake::TimedOut => continue,
            Wake::Ready(_) => {}
        }

        if let Err(e) = socket.send_to(SERVER_BEACON, dest).await {
            warn!("Failed to send beacon to {}: {}", dest, e);
        }

        tracker.sweep(Instant::now());
    }

    debug!("Beacon loop exiting");
}

async fn ack_loop(
    socket: UdpSocket,
    read_timeout: Duration,
    tracker: PeerTracker,
    signal: StopSignal,
) {
    // ---
    let mut buf = [0u8; 256];

    while signal.is_running() {
        let (len, from) = match wait_or_stop(&signal, read_timeout, socket.recv_from(&mut buf)).await
        {
            Wake::Stopped => break,
            Wake::TimedOut => continue,
            Wake::Ready(Ok(received)) => received,
            Wake::Ready(Err(e)) => {
                warn!("Ack receive failed: {}", e);
                continue;
            }
        };

        match DiscoveryToken::parse(&buf[..len]) {
            Some(DiscoveryToken::ClientAck) => tracker.on_ack(from.ip(), Instant::now()),
            _ => warn!(
                "Ignoring unrecognized discovery payload from {}: {:?}",
                from,
                String::from_utf8_lossy(&buf[..len])
            ),
        }
    }

    debug!("Ack loop exiting");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use wss_common::CLIENT_ACK;

    fn collect_events(bus: &EventBus<DiscoveryEvent>) -> Arc<Mutex<Vec<DiscoveryEvent>>> {
        // ---
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |e: &DiscoveryEvent| sink.lock().push(e.clone()));
        seen
    }

    #[test]
    fn test_tracker_fires_each_event_once() {
        // ---
        let registry = Arc::new(PeerRegistry::new());
        let bus = Arc::new(EventBus::new());
        let seen = collect_events(&bus);
        let tracker = PeerTracker::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            None,
            Duration::from_secs(4),
        );

        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let t0 = Instant::now();
        tracker.on_ack(peer, t0);
        tracker.on_ack(peer, t0 + Duration::from_secs(1));

        assert_eq!(tracker.sweep(t0 + Duration::from_secs(4)), 0);
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(6)), 1);
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(8)), 0);

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DiscoveryEvent::PeerJoined(p) if p.address == peer));
        assert!(matches!(&events[1], DiscoveryEvent::PeerExpired(p) if p.address == peer));
    }

    #[tokio::test]
    async fn test_beacons_and_acks_over_loopback() {
        // ---
        let listener = UdpSocket::bind("127.0.0.1:0").await.expect("bind listener");
        let beacon_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind beacon");
        let ack_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind ack");

        let settings = DiscoverySettings {
            tick: Duration::from_millis(50),
            peer_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_millis(50),
            stop_timeout: Duration::from_millis(500),
        };

        let registry = Arc::new(PeerRegistry::new());
        let bus = Arc::new(EventBus::new());
        let seen = collect_events(&bus);

        let server = DiscoveryServer::with_sockets(
            beacon_socket,
            listener.local_addr().expect("addr"),
            ack_socket,
            settings,
            Arc::clone(&registry),
            Arc::clone(&bus),
            None,
        )
        .expect("start");

        // A beacon arrives
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
            .await
            .expect("beacon timeout")
            .expect("recv");
        assert_eq!(&buf[..n], SERVER_BEACON);

        // Garbage is ignored, the ack registers the peer
        listener.send_to(b"hello", server.ack_addr()).await.expect("send");
        listener.send_to(CLIENT_ACK, server.ack_addr()).await.expect("send");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.len(), 1);

        // Silence past the timeout expires it
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(registry.is_empty());

        server.stop().await;

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], DiscoveryEvent::PeerExpired(_)));
    }
}
