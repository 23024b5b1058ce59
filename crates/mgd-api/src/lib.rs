//! ---
//! mgd_section: "05-networking-external-interfaces"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Observer-facing REST and WebSocket surface."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Observer read interface.
//!
//! One pull operation (`GET /snapshot` returns the latest snapshot or a
//! not-ready sentinel), a liveness summary, a Prometheus scrape endpoint,
//! and a WebSocket that pushes each published snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mgd_core::SnapshotBroadcaster;
use prometheus::{Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Controller liveness summary returned by `/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerStatus {
    pub link_up: bool,
    pub tick: u64,
    pub frames_received: u64,
    pub bad_frames: u64,
    pub dispatches_sent: u64,
    pub oracle_timeouts: u64,
    pub oracle_coalesced: u64,
}

/// Provides the `/status` summary.
pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> ControllerStatus;
}

struct ApiState {
    broadcaster: SnapshotBroadcaster,
    status: Option<Arc<dyn StatusSource>>,
    metrics: Option<Arc<Registry>>,
}

/// Builder for the observer API server.
pub struct ObserverApiBuilder {
    listen: SocketAddr,
    broadcaster: SnapshotBroadcaster,
    status: Option<Arc<dyn StatusSource>>,
    metrics: Option<Arc<Registry>>,
}

impl ObserverApiBuilder {
    pub fn new(listen: SocketAddr, broadcaster: SnapshotBroadcaster) -> Self {
        Self {
            listen,
            broadcaster,
            status: None,
            metrics: None,
        }
    }

    /// Attach a `/status` provider.
    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status = Some(source);
        self
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: Arc<Registry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Spawn the server and return a shutdown handle.
    pub async fn spawn(self) -> anyhow::Result<ObserverApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "observer api listening");

        let state = Arc::new(ApiState {
            broadcaster: self.broadcaster,
            status: self.status,
            metrics: self.metrics,
        });
        let router = Router::new()
            .route("/snapshot", get(get_snapshot))
            .route("/status", get(get_status))
            .route("/metrics", get(get_metrics))
            .route("/ws", get(upgrade_handler))
            .with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "observer api exited with error");
            }
        });

        Ok(ObserverApiHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for the running observer API server.
pub struct ObserverApiHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ObserverApiHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

async fn get_snapshot(State(state): State<Arc<ApiState>>) -> Response {
    match state.broadcaster.latest() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "not ready" })),
        )
            .into_response(),
    }
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Response {
    let Some(source) = &state.status else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "status source unavailable" })),
        )
            .into_response();
    };
    Json(source.status()).into_response()
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };

    let encoder = TextEncoder::new();
    let families = registry.gather();
    match encoder.encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> Response {
    ws.on_upgrade(|socket| observer_loop(socket, state))
}

/// Push every published snapshot to the connected observer until either side
/// goes away.
async fn observer_loop(mut socket: WebSocket, state: Arc<ApiState>) {
    let mut updates = state.broadcaster.subscribe();

    // Late joiners get the current snapshot immediately.
    if let Some(snapshot) = state.broadcaster.latest() {
        if let Ok(text) = serde_json::to_string(snapshot.as_ref()) {
            if socket.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                let Some(snapshot) = snapshot else { continue };
                let Ok(text) = serde_json::to_string(snapshot.as_ref()) else {
                    warn!("failed to serialise snapshot for observer");
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Observers are read-only; other input is ignored.
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "observer socket error");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use mgd_core::{Economics, Snapshot};
    use std::collections::BTreeMap;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    fn snapshot(tick: u64) -> Snapshot {
        Snapshot {
            tick,
            timestamp_ms: (tick * 42) as u32,
            captured_at: Utc::now(),
            nodes: Vec::new(),
            optimization_time_ms: 0.4,
            confidence_score: 0.92,
            dispatch_count: 0,
            link_down: false,
            solver_fallback: false,
            escalating: false,
            oracle_override: false,
            economic: Economics {
                total_cost: 1.0,
                cycle_cost: 0.1,
                cost_per_second: 2.4,
                cost_per_amp: 0.1,
                total_demand: 5.0,
                total_supply: 5.0,
                unmet_demand: 0.0,
                efficiency_percent: 100.0,
                green_energy_percent: 40.0,
                source_usage: BTreeMap::new(),
                dispatch_details: Vec::new(),
            },
        }
    }

    struct FixedStatus;
    impl StatusSource for FixedStatus {
        fn status(&self) -> ControllerStatus {
            ControllerStatus {
                link_up: true,
                tick: 7,
                frames_received: 100,
                bad_frames: 1,
                dispatches_sent: 99,
                oracle_timeouts: 0,
                oracle_coalesced: 2,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_endpoint_serves_latest_or_not_ready() {
        let broadcaster = SnapshotBroadcaster::new();
        let registry = mgd_metrics::new_registry();
        let handle = ObserverApiBuilder::new("127.0.0.1:0".parse().unwrap(), broadcaster.clone())
            .with_status_source(Arc::new(FixedStatus))
            .with_metrics_registry(registry)
            .spawn()
            .await
            .unwrap();
        let base = format!("http://{}", handle.local_addr());
        let client = reqwest::Client::new();

        let not_ready = client
            .get(format!("{base}/snapshot"))
            .send()
            .await
            .unwrap();
        assert_eq!(not_ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        broadcaster.publish(snapshot(3));
        let ready: Snapshot = client
            .get(format!("{base}/snapshot"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ready.tick, 3);
        assert!((ready.confidence_score - 0.92).abs() < 1e-9);

        let status: ControllerStatus = client
            .get(format!("{base}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(status.link_up);
        assert_eq!(status.tick, 7);

        let metrics = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(metrics.status(), reqwest::StatusCode::OK);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_pushes_published_snapshots() {
        let broadcaster = SnapshotBroadcaster::new();
        let handle = ObserverApiBuilder::new("127.0.0.1:0".parse().unwrap(), broadcaster.clone())
            .spawn()
            .await
            .unwrap();
        let url = format!("ws://{}/ws", handle.local_addr());

        let (mut socket, _) = connect_async(&url).await.unwrap();
        broadcaster.publish(snapshot(1));
        broadcaster.publish(snapshot(2));

        let mut last_tick = 0;
        while last_tick < 2 {
            match tokio::time::timeout(std::time::Duration::from_secs(2), socket.next())
                .await
                .expect("snapshot pushed")
            {
                Some(Ok(WsMessage::Text(payload))) => {
                    let snapshot: Snapshot = serde_json::from_str(&payload).unwrap();
                    assert!(snapshot.tick > last_tick, "ticks must be increasing");
                    last_tick = snapshot.tick;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }

        handle.shutdown().await.unwrap();
    }
}
