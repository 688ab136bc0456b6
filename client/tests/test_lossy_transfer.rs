//! End-to-end transfers from the streaming server to the client over a
//! simulated lossy network.
//!
//! The server streams to a relay socket, the relay pushes every datagram
//! through the network simulator and forwards survivors to the client.
//! Recovery runs over real loopback TCP.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use rand::{Rng, SeedableRng};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use client::{
    CacheHandle, ContentCache, DiskSink, DynamicSink, MulticastReceiver, ReceiveContext,
    ReceiverEvent, ReceiverSettings, StreamReceiver,
};
use server::{stream_song, CurrentSong, MulticastSender, RecoveryServer};
use wss_common::{split, ControlMessage, EventBus, Id3v1Metadata, ReassemblyBuffer, MAX_PAYLOAD};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

fn make_song(len: usize, seed: u64) -> Vec<u8> {
    // ---
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Forwards datagrams arriving on `relay` to `dest` through `sim`.
fn spawn_relay(relay: UdpSocket, dest: SocketAddr, mut sim: NetworkSimulator) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(2), relay.recv(&mut buf)).await
            {
                sim.send(buf[..n].to_vec());
            }
            while let Some(bytes) = sim.receive() {
                let _ = relay.send_to(&bytes, dest).await;
            }
        }
    })
}

struct Rig {
    sender: MulticastSender,
    current: CurrentSong,
    recovery: RecoveryServer,
    receiver: StreamReceiver,
    relay: JoinHandle<()>,
    completed: mpsc::UnboundedReceiver<CacheHandle>,
    _dir: tempfile::TempDir,
}

async fn rig(config: NetworkSimulatorConfig) -> Rig {
    // ---
    let current = CurrentSong::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
    let recovery = RecoveryServer::with_listener(
        listener,
        current.clone(),
        READ_TIMEOUT,
        STOP_TIMEOUT,
        None,
    )
    .expect("recovery server");

    let client_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    let client_addr = client_socket.local_addr().expect("addr");
    let relay_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind relay");
    let relay_addr = relay_socket.local_addr().expect("addr");
    let relay = spawn_relay(relay_socket, client_addr, NetworkSimulator::new(config));

    let dir = tempfile::tempdir().expect("tempdir");
    let sink: Arc<dyn DiskSink> = Arc::new(
        DynamicSink::new(&dir.path().join("stream"), "wss_", ".audio").expect("sink"),
    );
    let cache = Arc::new(
        ContentCache::new(dir.path(), "wss_", ".audio", 64 * 1024 * 1024, None).expect("cache"),
    );

    let (tx, completed) = mpsc::unbounded_channel();
    let events = Arc::new(EventBus::new());
    events.subscribe(move |e: &ReceiverEvent| {
        if let ReceiverEvent::SongCompleted(handle) = e {
            let _ = tx.send(handle.clone());
        }
    });

    let (_, server_rx) = watch::channel(Some(recovery.local_addr()));
    let receiver = StreamReceiver::with_socket(
        MulticastReceiver::from_socket(client_socket),
        server_rx,
        ReceiveContext {
            sink,
            cache,
            events,
            metadata: Arc::new(Id3v1Metadata),
            metrics: None,
        },
        ReceiverSettings {
            max_expected_count: 100_000,
            read_timeout: READ_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
        },
    );

    let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
    let sender = MulticastSender::from_socket(udp, relay_addr);

    Rig {
        sender,
        current,
        recovery,
        receiver,
        relay,
        completed,
        _dir: dir,
    }
}

impl Rig {
    async fn next_song(&mut self) -> CacheHandle {
        // ---
        tokio::time::timeout(Duration::from_secs(15), self.completed.recv())
            .await
            .expect("song did not complete in time")
            .expect("event channel closed")
    }

    async fn shutdown(self) {
        // ---
        self.receiver.stop().await;
        self.recovery.stop().await;
        self.relay.abort();
    }
}

/// A clean network delivers the song without recovery.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clean_network_transfer() {
    // ---
    let mut rig = rig(NetworkSimulatorConfig::default()).await;
    let song = make_song(50_000, 1);

    stream_song(&song, &mut rig.sender, &rig.current, Duration::from_micros(200), None)
        .await
        .expect("stream");

    let handle = rig.next_song().await;
    assert_eq!(std::fs::read(&handle.path).expect("read cached"), song);
    assert_eq!(handle.hash, ContentCache::hash_of(&song));

    rig.shutdown().await;
    println!("✓ Clean network transfer completes");
}

/// 20% loss, reordering and duplicates: recovery fills every gap.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lossy_network_transfer() {
    // ---
    let mut rig = rig(NetworkSimulatorConfig {
        loss_rate: 0.2,
        jitter_ms: 2,
        reorder_rate: 0.1,
        duplicate_rate: 0.05,
        spare_control: true,
        seed: Some(42),
    })
    .await;
    let song = make_song(200_000, 2);

    stream_song(&song, &mut rig.sender, &rig.current, Duration::from_micros(200), None)
        .await
        .expect("stream");

    let handle = rig.next_song().await;
    assert_eq!(std::fs::read(&handle.path).expect("read cached"), song);

    rig.shutdown().await;
    println!("✓ Lossy network transfer recovered");
}

/// The sender skips to a new song halfway through the first.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mid_stream_skip() {
    // ---
    let mut rig = rig(NetworkSimulatorConfig::default()).await;
    let first = make_song(30_000, 3);
    let second = make_song(20_000, 4);

    // Half of the first song, no finalization
    let datagrams = split(&first, MAX_PAYLOAD).expect("split");
    rig.sender
        .send_control(&ControlMessage::StreamInit {
            expected_count: datagrams.len() as u32,
        })
        .await
        .expect("init");
    for d in &datagrams[..datagrams.len() / 2] {
        rig.sender.send_datagram(d).await.expect("send");
        tokio::time::sleep(Duration::from_micros(200)).await;
    }

    stream_song(&second, &mut rig.sender, &rig.current, Duration::from_micros(200), None)
        .await
        .expect("stream");

    let handle = rig.next_song().await;
    assert_eq!(std::fs::read(&handle.path).expect("read cached"), second);

    // The abandoned song never completes
    let extra = tokio::time::timeout(Duration::from_millis(500), rig.completed.recv()).await;
    assert!(extra.is_err());

    rig.shutdown().await;
    println!("✓ Mid-stream skip delivers only the new song");
}

/// Two equal-length songs over a lossy link. The next song is installed on
/// the server before the first one's gaps are recovered, so recovery must
/// keep answering from the song the client acknowledged.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lossy_back_to_back_songs_stay_intact() {
    // ---
    let mut rig = rig(NetworkSimulatorConfig {
        loss_rate: 0.2,
        jitter_ms: 2,
        reorder_rate: 0.1,
        duplicate_rate: 0.0,
        spare_control: true,
        seed: Some(7),
    })
    .await;
    let first = make_song(100_000, 5);
    let second = make_song(100_000, 6);
    assert_eq!(
        split(&first, MAX_PAYLOAD).expect("split").len(),
        split(&second, MAX_PAYLOAD).expect("split").len()
    );

    stream_song(&first, &mut rig.sender, &rig.current, Duration::from_micros(200), None)
        .await
        .expect("stream first");

    // The playlist moves on right away; the first song's finalization is
    // still in flight.
    rig.current.replace(ReassemblyBuffer::from_datagrams(
        split(&second, MAX_PAYLOAD).expect("split"),
    ));

    let handle = rig.next_song().await;
    assert_eq!(handle.hash, ContentCache::hash_of(&first));
    assert_eq!(std::fs::read(&handle.path).expect("read cached"), first);

    stream_song(&second, &mut rig.sender, &rig.current, Duration::from_micros(200), None)
        .await
        .expect("stream second");

    let handle = rig.next_song().await;
    assert_eq!(handle.hash, ContentCache::hash_of(&second));
    assert_eq!(std::fs::read(&handle.path).expect("read cached"), second);

    rig.shutdown().await;
    println!("✓ Back-to-back songs recovered from the right song");
}
