//! Client side of discovery.
//!
//! Listens for the server beacon, tracks which server is current, answers
//! every beacon with an acknowledgement and publishes the recovery
//! endpoint of the current server for the recovery client.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wss_common::{
    wait_or_stop, Config, DiscoveryToken, EventBus, StopSignal, Wake, Worker, CLIENT_ACK,
};

/// Server presence notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(IpAddr),
    Disconnected(IpAddr),
}

/// Decides which beacons change the current server.
#[derive(Debug)]
pub struct ServerTracker {
    // ---
    current: Option<IpAddr>,
    last_beacon: Option<Instant>,
    timeout: Duration,
}

impl ServerTracker {
    // ---
    /// Creates a tracker that forgets a server silent for `timeout`.
    pub fn new(timeout: Duration) -> Self {
        // ---
        Self {
            current: None,
            last_beacon: None,
            timeout,
        }
    }

    pub fn current(&self) -> Option<IpAddr> {
        self.current
    }

    /// Applies a beacon from `address` received at `now`.
    ///
    /// A beacon from the current server produces no events.
    pub fn on_beacon(&mut self, address: IpAddr, now: Instant) -> Vec<ServerEvent> {
        // ---
        self.last_beacon = Some(now);

        if self.current == Some(address) {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);
        if let Some(previous) = self.current.replace(address) {
            events.push(ServerEvent::Disconnected(previous));
        }
        events.push(ServerEvent::Connected(address));
        events
    }

    /// Drops the current server if it has been silent past the timeout.
    pub fn check_silence(&mut self, now: Instant) -> Option<ServerEvent> {
        // ---
        let last = self.last_beacon?;
        if now.saturating_duration_since(last) <= self.timeout {
            return None;
        }

        self.last_beacon = None;
        self.current.take().map(ServerEvent::Disconnected)
    }
}

/// Ports the client talks to once a server is known.
#[derive(Debug, Clone, Copy)]
pub struct ServerPorts {
    pub ack_port: u16,
    pub recovery_port: u16,
}

/// Running discovery listener.
pub struct DiscoveryClient {
    // ---
    server: watch::Receiver<Option<SocketAddr>>,
    local_addr: SocketAddr,
    worker: Worker,
    stop_timeout: Duration,
}

impl DiscoveryClient {
    // ---
    /// Binds the discovery port and starts listening.
    ///
    /// # Errors
    ///
    /// Returns error if the discovery port cannot be bound.
    pub fn start(config: &Config, events: Arc<EventBus<ServerEvent>>) -> Result<Self> {
        // ---
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create discovery socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.discovery_port);
        socket
            .bind(&bind.into())
            .with_context(|| format!("failed to bind discovery port {}", config.discovery_port))?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;

        Self::with_socket(
            socket,
            ServerPorts {
                ack_port: config.ack_port,
                recovery_port: config.recovery_port,
            },
            config.read_timeout(),
            config.peer_timeout(),
            config.stop_timeout(),
            events,
        )
    }

    /// Starts listening on an already-bound socket.
    pub fn with_socket(
        socket: UdpSocket,
        ports: ServerPorts,
        read_timeout: Duration,
        server_timeout: Duration,
        stop_timeout: Duration,
        events: Arc<EventBus<ServerEvent>>,
    ) -> Result<Self> {
        // ---
        let local_addr = socket.local_addr()?;
        info!("Listening for server beacons on {}", local_addr);

        let (tx, rx) = watch::channel(None);
        let signal = StopSignal::new();

        let worker = Worker::spawn(
            "discovery-client",
            signal.clone(),
            listen_loop(
                socket,
                ports,
                read_timeout,
                ServerTracker::new(server_timeout),
                events,
                tx,
                signal,
            ),
        );

        Ok(Self {
            server: rx,
            local_addr,
            worker,
            stop_timeout,
        })
    }

    /// Recovery endpoint of the current server, updated as servers come
    /// and go.
    pub fn server(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.server.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        // ---
        self.worker.stop(self.stop_timeout).await;
        info!("Discovery client stopped");
    }
}

async fn listen_loop(
    socket: UdpSocket,
    ports: ServerPorts,
    read_timeout: Duration,
    mut tracker: ServerTracker,
    events: Arc<EventBus<ServerEvent>>,
    server: watch::Sender<Option<SocketAddr>>,
    signal: StopSignal,
) {
    // ---
    let mut buf = [0u8; 256];

    while signal.is_running() {
        let received = wait_or_stop(&signal, read_timeout, socket.recv_from(&mut buf)).await;

        let fired: Vec<ServerEvent> = match received {
            Wake::Stopped => break,
            Wake::TimedOut => tracker.check_silence(Instant::now()).into_iter().collect(),
            Wake::Ready(Err(e)) => {
                warn!("Beacon receive failed: {}", e);
                continue;
            }
            Wake::Ready(Ok((len, from))) => match DiscoveryToken::parse(&buf[..len]) {
                Some(DiscoveryToken::ServerBeacon) => {
                    let ack_to = SocketAddr::new(from.ip(), ports.ack_port);
                    if let Err(e) = socket.send_to(CLIENT_ACK, ack_to).await {
                        warn!("Failed to acknowledge beacon to {}: {}", ack_to, e);
                    }
                    tracker.on_beacon(from.ip(), Instant::now())
                }
                _ => {
                    warn!(
                        "Ignoring unrecognized discovery payload from {}: {:?}",
                        from,
                        String::from_utf8_lossy(&buf[..len])
                    );
                    continue;
                }
            },
        };

        for event in fired {
            match event {
                ServerEvent::Connected(ip) => info!("Server connected: {}", ip),
                ServerEvent::Disconnected(ip) => info!("Server disconnected: {}", ip),
            }
            events.publish(&event);
        }

        let endpoint = tracker
            .current()
            .map(|ip| SocketAddr::new(ip, ports.recovery_port));
        server.send_if_modified(|current| {
            if *current == endpoint {
                return false;
            }
            *current = endpoint;
            true
        });
    }

    debug!("Discovery listener exiting");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use parking_lot::Mutex;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_repeated_beacons_are_debounced() {
        // ---
        let mut tracker = ServerTracker::new(Duration::from_secs(4));
        let now = Instant::now();

        assert_eq!(tracker.on_beacon(ip(1), now), vec![ServerEvent::Connected(ip(1))]);
        assert!(tracker.on_beacon(ip(1), now).is_empty());
        assert!(tracker.on_beacon(ip(1), now).is_empty());
    }

    #[test]
    fn test_server_switch() {
        // ---
        let mut tracker = ServerTracker::new(Duration::from_secs(4));
        let now = Instant::now();

        tracker.on_beacon(ip(1), now);
        assert_eq!(
            tracker.on_beacon(ip(2), now),
            vec![ServerEvent::Disconnected(ip(1)), ServerEvent::Connected(ip(2))]
        );
        assert_eq!(tracker.current(), Some(ip(2)));
    }

    #[test]
    fn test_silent_server_dropped() {
        // ---
        let mut tracker = ServerTracker::new(Duration::from_secs(4));
        let t0 = Instant::now();

        assert_eq!(tracker.check_silence(t0), None);
        tracker.on_beacon(ip(1), t0);
        assert_eq!(tracker.check_silence(t0 + Duration::from_secs(3)), None);
        assert_eq!(
            tracker.check_silence(t0 + Duration::from_secs(5)),
            Some(ServerEvent::Disconnected(ip(1)))
        );
        assert_eq!(tracker.check_silence(t0 + Duration::from_secs(9)), None);
        assert_eq!(tracker.current(), None);
    }

    #[tokio::test]
    async fn test_beacon_is_acknowledged() {
        // ---
        // Stands in for the server: sends beacons, receives acks
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = server.local_addr().expect("addr");

        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |e: &ServerEvent| sink.lock().push(*e));

        let client = DiscoveryClient::with_socket(
            socket,
            ServerPorts {
                ack_port: server_addr.port(),
                recovery_port: 6070,
            },
            Duration::from_millis(50),
            Duration::from_secs(4),
            Duration::from_millis(500),
            Arc::clone(&bus),
        )
        .expect("start");

        let mut endpoint = client.server();
        server
            .send_to(b"WSSServer", client.local_addr())
            .await
            .expect("send");
        server
            .send_to(b"WSSServer", client.local_addr())
            .await
            .expect("send");

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
                .await
                .expect("ack timeout")
                .expect("recv");
            assert_eq!(&buf[..n], CLIENT_ACK);
        }

        tokio::time::timeout(Duration::from_secs(2), endpoint.wait_for(|e| e.is_some()))
            .await
            .expect("endpoint timeout")
            .expect("watch closed");
        assert_eq!(
            *endpoint.borrow(),
            Some(SocketAddr::new(server_addr.ip(), 6070))
        );

        client.stop().await;
        assert_eq!(*seen.lock(), vec![ServerEvent::Connected(server_addr.ip())]);
    }
}
