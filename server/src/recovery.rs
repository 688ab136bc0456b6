//! Recovery channel, server side.
//!
//! Accepts TCP connections on the streaming port. Each connection gets its
//! own reader task that parses newline-terminated `<missing>` requests and
//! answers with the encoded datagrams, in the order they were requested.
//! A connection is served from the song its client last acknowledged, or
//! the newest song when it has not acknowledged one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use wss_common::{
    wait_or_stop, Config, ControlMessage, MetricsContext, ReassemblyBuffer, StopSignal, Wake,
    Worker,
};

use crate::song::{CurrentSong, Song};

/// Concatenates the encoded datagrams for `sequences`, in request order.
///
/// Sequence numbers the song does not hold are skipped. Returns the bytes
/// and the number of datagrams they contain.
pub fn replay(song: &ReassemblyBuffer, sequences: &[u32]) -> (Vec<u8>, usize) {
    // ---
    let mut out = Vec::new();
    let mut count = 0;

    for &seq in sequences {
        let Some(datagram) = song.get(seq) else {
            debug!("Requested sequence {} not in current song", seq);
            continue;
        };

        match datagram.encode() {
            Ok(bytes) => {
                out.extend_from_slice(&bytes);
                count += 1;
            }
            Err(e) => warn!("Cannot replay sequence {}: {}", seq, e),
        }
    }

    (out, count)
}

struct Connection {
    peer: SocketAddr,
    worker: Worker,
}

/// Running recovery acceptor and its per-connection readers.
pub struct RecoveryServer {
    // ---
    local_addr: SocketAddr,
    acceptor: Worker,
    connections: Arc<Mutex<Vec<Connection>>>,
    stop_timeout: Duration,
}

impl RecoveryServer {
    // ---
    /// Binds the recovery port and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound.
    pub async fn start(
        config: &Config,
        song: CurrentSong,
        metrics: Option<MetricsContext>,
    ) -> Result<Self> {
        // ---
        let listener = TcpListener::bind(("0.0.0.0", config.recovery_port))
            .await
            .with_context(|| format!("failed to bind recovery port {}", config.recovery_port))?;

        Self::with_listener(
            listener,
            song,
            config.read_timeout(),
            config.stop_timeout(),
            metrics,
        )
    }

    /// Starts accepting on an already-bound listener.
    pub fn with_listener(
        listener: TcpListener,
        song: CurrentSong,
        read_timeout: Duration,
        stop_timeout: Duration,
        metrics: Option<MetricsContext>,
    ) -> Result<Self> {
        // ---
        let local_addr = listener.local_addr()?;
        info!("Recovery channel listening on {}", local_addr);

        let connections = Arc::new(Mutex::new(Vec::new()));
        let signal = StopSignal::new();

        let acceptor = Worker::spawn(
            "recovery-acceptor",
            signal.clone(),
            accept_loop(
                listener,
                song,
                Arc::clone(&connections),
                read_timeout,
                metrics,
                signal,
            ),
        );

        Ok(Self {
            local_addr,
            acceptor,
            connections,
            stop_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections whose reader is still running.
    pub fn open_connections(&self) -> usize {
        // ---
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.worker.is_finished())
            .count()
    }

    /// Stops the acceptor, then every connection reader.
    pub async fn stop(self) {
        // ---
        self.acceptor.stop(self.stop_timeout).await;

        let connections: Vec<Connection> = std::mem::take(&mut *self.connections.lock());
        for connection in connections {
            debug!("Closing recovery connection from {}", connection.peer);
            connection.worker.stop(self.stop_timeout).await;
        }
        info!("Recovery channel stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    song: CurrentSong,
    connections: Arc<Mutex<Vec<Connection>>>,
    read_timeout: Duration,
    metrics: Option<MetricsContext>,
    signal: StopSignal,
) {
    // ---
    while signal.is_running() {
        let accepted = wait_or_stop(&signal, read_timeout, listener.accept()).await;

        // Readers that already ended are dropped here
        connections.lock().retain(|c| !c.worker.is_finished());

        let (stream, peer) = match accepted {
            Wake::Stopped => break,
            Wake::TimedOut => continue,
            Wake::Ready(Ok(accepted)) => accepted,
            Wake::Ready(Err(e)) => {
                warn!("Recovery accept failed: {}", e);
                continue;
            }
        };

        info!("Recovery connection from {}", peer);
        let conn_signal = StopSignal::new();
        let worker = Worker::spawn(
            format!("recovery-{peer}"),
            conn_signal.clone(),
            serve_connection(
                stream,
                peer,
                song.clone(),
                read_timeout,
                metrics.clone(),
                conn_signal,
            ),
        );
        connections.lock().push(Connection { peer, worker });
    }

    debug!("Recovery acceptor exiting");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    song: CurrentSong,
    read_timeout: Duration,
    metrics: Option<MetricsContext>,
    signal: StopSignal,
) {
    // ---
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut bound: Option<Arc<Song>> = None;

    while signal.is_running() {
        let line = match wait_or_stop(&signal, read_timeout, lines.next_line()).await {
            Wake::Stopped => break,
            Wake::TimedOut => continue,
            Wake::Ready(Ok(Some(line))) => line,
            Wake::Ready(Ok(None)) => {
                debug!("Recovery connection from {} closed", peer);
                break;
            }
            Wake::Ready(Err(e)) => {
                warn!("Recovery read from {} failed: {}", peer, e);
                break;
            }
        };

        match ControlMessage::parse(line.as_bytes()) {
            Ok(ControlMessage::Missing(sequences)) => {
                let Some(current) = bound.clone().or_else(|| song.snapshot()) else {
                    warn!("{} requested {} datagrams but no song is loaded", peer, sequences.len());
                    continue;
                };

                let (bytes, count) = replay(&current.buffer, &sequences);
                debug!(
                    "Replaying {}/{} datagrams of song {} to {}",
                    count,
                    sequences.len(),
                    current.id,
                    peer
                );

                if let Some(m) = &metrics {
                    m.recovery_requests_total.inc();
                    m.datagrams_recovered_total.inc_by(count as u64);
                }

                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("Recovery write to {} failed: {}", peer, e);
                    break;
                }
            }
            Ok(ControlMessage::InitAck { expected_count }) => {
                bound = song.newest_with_count(expected_count);
                match &bound {
                    Some(s) => debug!("{} is receiving song {} ({} datagrams)", peer, s.id, expected_count),
                    None => warn!("{} acked an unknown stream of {} datagrams", peer, expected_count),
                }
            }
            Ok(other) => warn!("Ignoring unexpected control {} from {}", other, peer),
            Err(e) => warn!("Ignoring recovery line from {}: {}", peer, e),
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use wss_common::{split, Datagram};

    fn song(count: u32) -> ReassemblyBuffer {
        // ---
        ReassemblyBuffer::from_datagrams(
            (1..=count)
                .map(|seq| Datagram::new(seq, vec![seq as u8; 10]))
                .collect(),
        )
    }

    #[test]
    fn test_replay_in_requested_order() {
        // ---
        let (bytes, count) = replay(&song(6), &[5, 2]);

        assert_eq!(count, 2);
        assert_eq!(bytes.len(), 2 * 18);
        assert_eq!(Datagram::decode(&bytes[..18]).map(|d| d.sequence), Ok(5));
        assert_eq!(Datagram::decode(&bytes[18..]).map(|d| d.sequence), Ok(2));
    }

    #[test]
    fn test_replay_skips_unknown() {
        // ---
        let (bytes, count) = replay(&song(3), &[9, 1]);

        assert_eq!(count, 1);
        assert_eq!(Datagram::decode(&bytes).map(|d| d.sequence), Ok(1));
    }

    #[tokio::test]
    async fn test_serves_missing_over_tcp() {
        // ---
        let current = CurrentSong::new();
        current.replace(ReassemblyBuffer::from_datagrams(split(&[7u8; 4200], 700).expect("split")));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = RecoveryServer::with_listener(
            listener,
            current,
            Duration::from_millis(100),
            Duration::from_millis(500),
            None,
        )
        .expect("start");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(ControlMessage::Missing(vec![2, 5]).to_line().as_bytes())
            .await
            .expect("write");

        let mut reply = vec![0u8; 2 * 708];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut reply)
            .await
            .expect("read");

        assert_eq!(Datagram::decode(&reply[..708]).map(|d| d.sequence), Ok(2));
        assert_eq!(Datagram::decode(&reply[708..]).map(|d| d.sequence), Ok(5));
        assert_eq!(server.open_connections(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_acked_song_served_after_next_song_starts() {
        // ---
        let current = CurrentSong::new();
        current.replace(ReassemblyBuffer::from_datagrams(
            split(&[1u8; 2100], 700).expect("split"),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = RecoveryServer::with_listener(
            listener,
            current.clone(),
            Duration::from_millis(100),
            Duration::from_millis(500),
            None,
        )
        .expect("start");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(ControlMessage::InitAck { expected_count: 3 }.to_line().as_bytes())
            .await
            .expect("write ack");

        // Give the server time to bind the ack before the playlist advances.
        tokio::time::sleep(Duration::from_millis(50)).await;
        current.replace(ReassemblyBuffer::from_datagrams(
            split(&[2u8; 2800], 700).expect("split"),
        ));

        stream
            .write_all(ControlMessage::Missing(vec![2]).to_line().as_bytes())
            .await
            .expect("write missing");

        let mut reply = vec![0u8; 708];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut reply)
            .await
            .expect("read");

        let datagram = Datagram::decode(&reply).expect("decode");
        assert_eq!(datagram.sequence, 2);
        assert_eq!(datagram.payload.len(), 700);
        assert!(datagram.payload.iter().all(|b| *b == 1));

        server.stop().await;
    }
}
