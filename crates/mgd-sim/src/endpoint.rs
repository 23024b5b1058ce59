//! ---
//! mgd_section: "11-simulation-test-harness"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Synthetic telemetry and endpoint emulation."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mgd_proto::{
    decode_dispatch, encode_telemetry, telemetry_frame_len, CodecError, DispatchFrame,
    DISPATCH_HEADER_LEN, MAX_NODES,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::generator::TelemetryGenerator;

/// Emulated hardware endpoint: accepts one controller connection at a time,
/// streams generated telemetry at the configured cadence, and records the
/// dispatch commands it receives.
pub struct SimEndpoint;

impl SimEndpoint {
    pub async fn spawn(
        listen: SocketAddr,
        generator: TelemetryGenerator,
        tick_interval: Duration,
    ) -> Result<SimEndpointHandle> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "simulated endpoint listening");

        let last_dispatch: Arc<Mutex<Option<DispatchFrame>>> = Arc::new(Mutex::new(None));
        let dispatches = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            generator,
            tick_interval,
            last_dispatch.clone(),
            dispatches.clone(),
            shutdown_rx,
        ));

        Ok(SimEndpointHandle {
            address: local_addr,
            last_dispatch,
            dispatches,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to the running endpoint emulator.
pub struct SimEndpointHandle {
    address: SocketAddr,
    last_dispatch: Arc<Mutex<Option<DispatchFrame>>>,
    dispatches: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimEndpointHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The most recent dispatch frame received from the controller.
    pub fn last_dispatch(&self) -> Option<DispatchFrame> {
        self.last_dispatch.lock().clone()
    }

    pub fn dispatches_received(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut generator: TelemetryGenerator,
    tick_interval: Duration,
    last_dispatch: Arc<Mutex<Option<DispatchFrame>>>,
    dispatches: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick: u64 = 0;
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "controller connected to simulated endpoint");
                session(
                    stream,
                    &mut generator,
                    tick_interval,
                    &mut tick,
                    &last_dispatch,
                    &dispatches,
                    &mut shutdown_rx,
                )
                .await;
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "simulated endpoint accept failed");
                break;
            }
        }
    }
}

async fn session(
    stream: TcpStream,
    generator: &mut TelemetryGenerator,
    tick_interval: Duration,
    tick: &mut u64,
    last_dispatch: &Mutex<Option<DispatchFrame>>,
    dispatches: &AtomicU64,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut interval = tokio::time::interval(tick_interval);
    let mut inbound: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut frame_buf = vec![0u8; telemetry_frame_len(MAX_NODES)];

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = interval.tick() => {
                *tick += 1;
                let frame = generator.frame_at(*tick);
                match encode_telemetry(&frame, &mut frame_buf) {
                    Ok(written) => {
                        if writer.write_all(&frame_buf[..written]).await.is_err() {
                            debug!("controller disconnected from simulated endpoint");
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "telemetry encoding failed in simulator"),
                }
            }
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => return,
                    Ok(n) => {
                        inbound.extend_from_slice(&chunk[..n]);
                        drain_dispatches(&mut inbound, last_dispatch, dispatches);
                    }
                    Err(_) => return,
                }
            }
        }
    }
}

fn drain_dispatches(
    inbound: &mut Vec<u8>,
    last_dispatch: &Mutex<Option<DispatchFrame>>,
    dispatches: &AtomicU64,
) {
    loop {
        if inbound.len() < DISPATCH_HEADER_LEN {
            return;
        }
        match decode_dispatch(inbound) {
            Ok((frame, consumed)) => {
                inbound.drain(..consumed);
                dispatches.fetch_add(1, Ordering::Relaxed);
                *last_dispatch.lock() = Some(frame);
            }
            Err(CodecError::TruncatedFrame { .. }) => return,
            Err(err) => {
                warn!(error = %err, "simulator received malformed dispatch; dropping buffer");
                inbound.clear();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgd_proto::{decode_telemetry, dispatch_frame_len, encode_dispatch, DispatchCommand};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_streams_telemetry_and_accepts_dispatch() {
        let generator = TelemetryGenerator::new(1, 3, 1.0 / 24.0, 42);
        let handle = SimEndpoint::spawn(
            "127.0.0.1:0".parse().unwrap(),
            generator,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(handle.address()).await.unwrap();

        // Pull at least one complete telemetry frame.
        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            let mut collected = Vec::new();
            let mut buf = vec![0u8; 512];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                collected.extend_from_slice(&buf[..n]);
                match decode_telemetry(&collected) {
                    Ok((frame, _)) => return frame,
                    Err(CodecError::TruncatedFrame { .. }) => continue,
                    Err(err) => panic!("unexpected codec error {err:?}"),
                }
            }
        })
        .await
        .expect("telemetry frame");
        assert_eq!(frame.nodes.len(), 4);

        // Push a dispatch frame back.
        let dispatch = DispatchFrame {
            commands: vec![DispatchCommand {
                node_id: 2,
                supply: 0.4,
                source_id: 1,
            }],
        };
        let mut out = vec![0u8; dispatch_frame_len(1)];
        let written = encode_dispatch(&dispatch, &mut out).unwrap();
        stream.write_all(&out[..written]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.dispatches_received() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatch observed");
        assert_eq!(handle.last_dispatch(), Some(dispatch));

        drop(stream);
        handle.shutdown().await;
    }
}
