//! ---
//! mgd_section: "05-networking-external-interfaces"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Persistent duplex stream to the hardware endpoint."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mgd_proto::{
    decode_telemetry, scan_for_magic, CodecError, TELEMETRY_HEADER_LEN, TELEMETRY_MAGIC,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::slot::TelemetrySlot;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
/// Backoff jitter spread, +/-20%.
const BACKOFF_JITTER: f64 = 0.2;
/// Minimum spacing of bad-frame warnings.
const BAD_FRAME_LOG_INTERVAL: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// Link health and error counters, shared with the tick loop and metrics.
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub frames_received: AtomicU64,
    pub bad_frames: AtomicU64,
    pub dispatches_sent: AtomicU64,
    pub disconnects: AtomicU64,
}

impl LinkCounters {
    pub fn bad_frames(&self) -> u64 {
        self.bad_frames.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn dispatches_sent(&self) -> u64 {
        self.dispatches_sent.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }
}

/// Spawns and owns the endpoint connection task.
pub struct EndpointLink;

impl EndpointLink {
    /// Start the link against `address`. The handle is live immediately;
    /// connection establishment and recovery run in the background.
    pub fn spawn(address: String) -> LinkHandle {
        let telemetry = TelemetrySlot::new();
        let counters = Arc::new(LinkCounters::default());
        let (dispatch_tx, dispatch_rx) = watch::channel::<Option<Arc<Vec<u8>>>>(None);
        let (status_tx, status_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(connection_loop(
            address,
            telemetry.clone(),
            counters.clone(),
            dispatch_rx,
            status_tx,
            shutdown_rx,
        ));

        LinkHandle {
            telemetry,
            counters,
            dispatch_tx,
            status_rx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to the running endpoint link.
pub struct LinkHandle {
    telemetry: TelemetrySlot,
    counters: Arc<LinkCounters>,
    dispatch_tx: watch::Sender<Option<Arc<Vec<u8>>>>,
    status_rx: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    /// Non-blocking read of the most recent telemetry frame.
    pub fn take_telemetry(&self) -> Option<mgd_proto::TelemetryFrame> {
        self.telemetry.take()
    }

    /// Hand an encoded dispatch frame to the writer. Latest wins; the frame
    /// is dropped silently while the link is down.
    pub fn send_dispatch(&self, encoded: Vec<u8>) {
        let _ = self.dispatch_tx.send(Some(Arc::new(encoded)));
    }

    pub fn is_up(&self) -> bool {
        *self.status_rx.borrow()
    }

    pub fn status(&self) -> watch::Receiver<bool> {
        self.status_rx.clone()
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        self.counters.clone()
    }

    /// Stop the connection task, waiting up to `grace` for it to wind down.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
            debug!("endpoint link task outlived shutdown grace; aborted");
        }
    }
}

async fn connection_loop(
    address: String,
    telemetry: TelemetrySlot,
    counters: Arc<LinkCounters>,
    mut dispatch_rx: watch::Receiver<Option<Arc<Vec<u8>>>>,
    status_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_BASE;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let stream = tokio::select! {
            _ = shutdown_rx.changed() => break,
            connected = TcpStream::connect(address.as_str()) => connected,
        };

        match stream {
            Ok(stream) => {
                info!(endpoint = %address, "endpoint link established");
                let _ = status_tx.send(true);
                backoff = BACKOFF_BASE;
                session(
                    stream,
                    &telemetry,
                    &counters,
                    &mut dispatch_rx,
                    &mut shutdown_rx,
                )
                .await;
                let _ = status_tx.send(false);
                counters.disconnects.fetch_add(1, Ordering::Relaxed);
                if *shutdown_rx.borrow() {
                    break;
                }
                warn!(endpoint = %address, "endpoint link lost; reconnecting");
            }
            Err(err) => {
                let _ = status_tx.send(false);
                debug!(endpoint = %address, error = %err, retry_in = ?backoff, "endpoint connect failed");
            }
        }

        let pause = jittered(backoff);
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(pause) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
    let _ = status_tx.send(false);
}

/// Run one connected session until the stream fails or shutdown is signalled.
async fn session(
    stream: TcpStream,
    telemetry: &TelemetrySlot,
    counters: &LinkCounters,
    dispatch_rx: &mut watch::Receiver<Option<Arc<Vec<u8>>>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut last_bad_frame_log: Option<Instant> = None;
    // Ignore any dispatch staged before this session began.
    dispatch_rx.mark_unchanged();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!("endpoint closed the stream");
                        return;
                    }
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        drain_frames(&mut buffer, telemetry, counters, &mut last_bad_frame_log);
                    }
                    Err(err) => {
                        warn!(error = %err, "endpoint read failed");
                        return;
                    }
                }
            }
            changed = dispatch_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let frame = dispatch_rx.borrow_and_update().clone();
                if let Some(encoded) = frame {
                    // The frame is written whole; this is the only await the
                    // producer side blocks on.
                    if let Err(err) = writer.write_all(&encoded).await {
                        warn!(error = %err, "dispatch write failed");
                        return;
                    }
                    counters.dispatches_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Decode every complete frame in `buffer`, resynchronizing past malformed
/// input. Partial frames are left for the next read.
fn drain_frames(
    buffer: &mut Vec<u8>,
    telemetry: &TelemetrySlot,
    counters: &LinkCounters,
    last_bad_frame_log: &mut Option<Instant>,
) {
    loop {
        if buffer.len() < TELEMETRY_HEADER_LEN {
            return;
        }
        match decode_telemetry(buffer) {
            Ok((frame, consumed)) => {
                buffer.drain(..consumed);
                counters.frames_received.fetch_add(1, Ordering::Relaxed);
                // Replacing an unread frame is expected when the endpoint
                // outpaces the loop; latest wins.
                let _ = telemetry.publish(frame);
            }
            Err(CodecError::TruncatedFrame { .. }) => return,
            Err(err) => {
                counters.bad_frames.fetch_add(1, Ordering::Relaxed);
                log_bad_frame(&err, last_bad_frame_log);
                // Skip at least one byte, then cut to the next magic.
                let skip = scan_for_magic(&buffer[1..], TELEMETRY_MAGIC)
                    .map(|offset| offset + 1)
                    .unwrap_or(buffer.len());
                buffer.drain(..skip);
            }
        }
    }
}

fn log_bad_frame(err: &CodecError, last: &mut Option<Instant>) {
    let now = Instant::now();
    let due = last
        .map(|at| now.duration_since(at) >= BAD_FRAME_LOG_INTERVAL)
        .unwrap_or(true);
    if due {
        warn!(error = %err, "malformed telemetry frame; resynchronizing");
        *last = Some(now);
    }
}

fn jittered(backoff: Duration) -> Duration {
    let spread = rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    backoff.mul_f64(1.0 + spread)
}
