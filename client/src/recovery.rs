//! Recovery channel, client side.
//!
//! One task owns the TCP connection to the server's recovery port. The
//! receive loop queues requests; the task sends each as a line, reads back
//! the replayed datagrams and hands them to the receive loop tagged with
//! the transfer they were requested for. Failures are logged and never
//! retried here; the next gap check asks again.
//!
//! The server serves each connection from the song that connection last
//! acknowledged, so a freshly opened connection repeats the last ack before
//! its first missing request.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wss_common::{
    datagram, wait_or_stop, ControlMessage, Datagram, MetricsContext, StopSignal, Wake, Worker,
    HEADER_SIZE,
};

/// Outstanding requests beyond this are dropped.
const REQUEST_QUEUE_DEPTH: usize = 16;

/// Work for the recovery task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRequest {
    /// Tell the server a stream was accepted
    InitAck { expected_count: u32 },

    /// Ask for the listed sequence numbers of `transfer`
    Missing { transfer: u64, sequences: Vec<u32> },
}

/// Datagrams recovered for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBatch {
    pub transfer: u64,
    pub datagrams: Vec<Datagram>,
}

/// Cloneable handle used to queue requests.
#[derive(Debug, Clone)]
pub struct RecoveryHandle {
    tx: mpsc::Sender<RecoveryRequest>,
}

impl RecoveryHandle {
    // ---
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<RecoveryRequest>) -> Self {
        Self { tx }
    }

    /// Queues `request`. Returns `false` if the queue is full or the task
    /// has ended; the request is then dropped.
    pub fn request(&self, request: RecoveryRequest) -> bool {
        // ---
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(r)) => {
                debug!("Recovery queue full, dropping {:?}", r);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Running recovery task.
pub struct RecoveryClient {
    // ---
    handle: RecoveryHandle,
    worker: Worker,
    stop_timeout: Duration,
}

impl RecoveryClient {
    // ---
    /// Starts the recovery task.
    ///
    /// # Arguments
    ///
    /// * `server` - Recovery endpoint of the tracked server, if any
    /// * `recovered` - Where recovered datagrams are delivered
    /// * `read_timeout` - Bound on connect and on each reply
    /// * `stop_timeout` - Bounded join when stopping
    /// * `metrics` - Optional metrics context
    pub fn start(
        server: watch::Receiver<Option<SocketAddr>>,
        recovered: mpsc::Sender<RecoveredBatch>,
        read_timeout: Duration,
        stop_timeout: Duration,
        metrics: Option<MetricsContext>,
    ) -> Self {
        // ---
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let signal = StopSignal::new();

        let worker = Worker::spawn(
            "recovery-client",
            signal.clone(),
            recovery_loop(rx, server, recovered, read_timeout, metrics, signal),
        );

        Self {
            handle: RecoveryHandle { tx },
            worker,
            stop_timeout,
        }
    }

    pub fn handle(&self) -> RecoveryHandle {
        self.handle.clone()
    }

    pub async fn stop(self) {
        // ---
        self.worker.stop(self.stop_timeout).await;
    }
}

struct Connection {
    server: SocketAddr,
    stream: TcpStream,
}

async fn recovery_loop(
    mut requests: mpsc::Receiver<RecoveryRequest>,
    server: watch::Receiver<Option<SocketAddr>>,
    recovered: mpsc::Sender<RecoveredBatch>,
    read_timeout: Duration,
    metrics: Option<MetricsContext>,
    signal: StopSignal,
) {
    // ---
    let mut conn: Option<Connection> = None;
    let mut last_ack: Option<u32> = None;

    while signal.is_running() {
        let request = match wait_or_stop(&signal, read_timeout, requests.recv()).await {
            Wake::Stopped | Wake::Ready(None) => break,
            Wake::TimedOut => continue,
            Wake::Ready(Some(request)) => request,
        };

        let Some(target) = *server.borrow() else {
            debug!("No server known, dropping {:?}", request);
            continue;
        };

        if conn.as_ref().is_some_and(|c| c.server != target) {
            info!("Server changed to {}, reconnecting", target);
            conn = None;
            last_ack = None;
        }

        if let RecoveryRequest::InitAck { expected_count } = request {
            last_ack = Some(expected_count);
        }

        let mut fresh = false;
        if conn.is_none() {
            match wait_or_stop(&signal, read_timeout, TcpStream::connect(target)).await {
                Wake::Stopped => break,
                Wake::TimedOut => {
                    warn!("Recovery connect to {} timed out", target);
                    continue;
                }
                Wake::Ready(Err(e)) => {
                    warn!("Recovery connect to {} failed: {}", target, e);
                    continue;
                }
                Wake::Ready(Ok(stream)) => {
                    debug!("Recovery connection to {} open", target);
                    conn = Some(Connection {
                        server: target,
                        stream,
                    });
                    fresh = true;
                }
            }
        }

        let Some(c) = conn.as_mut() else {
            continue;
        };

        let outcome = match request {
            RecoveryRequest::InitAck { expected_count } => {
                send_line(&mut c.stream, &ControlMessage::InitAck { expected_count }).await
            }
            RecoveryRequest::Missing {
                transfer,
                sequences,
            } => {
                if let Some(m) = &metrics {
                    m.recovery_requests_total.inc();
                }
                let reack = last_ack.filter(|_| fresh);
                async {
                    if let Some(expected_count) = reack {
                        send_line(&mut c.stream, &ControlMessage::InitAck { expected_count })
                            .await?;
                    }
                    fetch(
                        &mut c.stream,
                        transfer,
                        &sequences,
                        read_timeout,
                        &recovered,
                        &signal,
                    )
                    .await
                }
                .await
            }
        };

        if let Err(e) = outcome {
            warn!("Recovery exchange with {} failed: {:#}", target, e);
            conn = None;
        }
    }

    debug!("Recovery client exiting");
}

async fn send_line(stream: &mut TcpStream, message: &ControlMessage) -> Result<()> {
    // ---
    stream
        .write_all(message.to_line().as_bytes())
        .await
        .context("failed to send recovery line")
}

/// Sends one missing request and forwards whatever arrives before the
/// reply goes quiet.
///
/// The server skips sequence numbers it no longer holds, so a short reply
/// is normal. It still leaves the stream position unknown, so it is
/// reported as an error and the connection is reopened next time.
async fn fetch(
    stream: &mut TcpStream,
    transfer: u64,
    sequences: &[u32],
    read_timeout: Duration,
    recovered: &mpsc::Sender<RecoveredBatch>,
    signal: &StopSignal,
) -> Result<()> {
    // ---
    send_line(stream, &ControlMessage::Missing(sequences.to_vec())).await?;
    debug!("Requested {} datagrams for transfer {}", sequences.len(), transfer);

    let mut datagrams = Vec::with_capacity(sequences.len());
    let mut result = Ok(());

    while datagrams.len() < sequences.len() {
        match wait_or_stop(signal, read_timeout, read_datagram(stream)).await {
            Wake::Ready(Ok(d)) => datagrams.push(d),
            Wake::Ready(Err(e)) => {
                result = Err(e);
                break;
            }
            Wake::TimedOut => {
                result = Err(anyhow::anyhow!(
                    "reply stalled after {}/{} datagrams",
                    datagrams.len(),
                    sequences.len()
                ));
                break;
            }
            Wake::Stopped => break,
        }
    }

    if !datagrams.is_empty() {
        debug!("Recovered {} datagrams for transfer {}", datagrams.len(), transfer);
        let batch = RecoveredBatch {
            transfer,
            datagrams,
        };
        if recovered.send(batch).await.is_err() {
            debug!("Receive loop gone, discarding recovered datagrams");
        }
    }

    result
}

/// Reads one encoded datagram framed by its own header.
async fn read_datagram(stream: &mut TcpStream) -> Result<Datagram> {
    // ---
    let mut header = [0u8; HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .await
        .context("recovery connection closed")?;

    let total = datagram::declared_len(&header)
        .ok_or_else(|| anyhow::anyhow!("invalid datagram header in recovery reply"))?;

    let mut bytes = vec![0u8; total];
    bytes[..HEADER_SIZE].copy_from_slice(&header);
    stream
        .read_exact(&mut bytes[HEADER_SIZE..])
        .await
        .context("recovery reply truncated")?;

    Ok(Datagram::decode(&bytes)?)
}
