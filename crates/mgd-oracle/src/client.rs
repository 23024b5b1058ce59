//! ---
//! mgd_section: "06-oracle-escalation"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Escalation requests to the external reasoning service."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mgd_common::{OracleConfig, SourceSpec};
use mgd_solver::Flow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Context shipped to the reasoning service on escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleRequest {
    /// Idempotency token; replies for an expired token are discarded.
    pub request_id: Uuid,
    /// The most recent published snapshots, newest last.
    pub snapshots: Vec<serde_json::Value>,
    pub sources: Vec<SourceSpec>,
    /// The allocation the gate declined to trust.
    pub rejected_flows: Vec<Flow>,
    pub confidence: f64,
}

/// Allocation proposed by the reasoning service, in the solver's output
/// shape. Subject to the same capacity and ramp validation before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleProposal {
    pub flows: Vec<Flow>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("oracle returned malformed payload: {0}")]
    Malformed(String),
}

/// Backing service the client escalates to.
#[async_trait]
pub trait OracleBackend: Send + Sync + 'static {
    async fn propose(&self, request: &OracleRequest) -> Result<OracleProposal, OracleError>;
}

/// Production backend: POSTs the request as JSON to the configured endpoint.
pub struct HttpOracleBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOracleBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl OracleBackend for HttpOracleBackend {
    async fn propose(&self, request: &OracleRequest) -> Result<OracleProposal, OracleError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let proposal = response.json::<OracleProposal>().await?;
        if !(0.0..=1.0).contains(&proposal.confidence) {
            return Err(OracleError::Malformed(format!(
                "confidence {} outside [0, 1]",
                proposal.confidence
            )));
        }
        Ok(proposal)
    }
}

#[derive(Debug, Default)]
struct Counters {
    coalesced: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

struct Shared {
    in_flight: AtomicBool,
    cell: Mutex<Option<(Uuid, OracleProposal)>>,
    counters: Counters,
}

/// Single-flight escalation client.
///
/// `submit` spawns the request task when none is outstanding; the tick loop
/// polls `take_proposal` at its oracle suspension point. A proposal is
/// consumed at most once.
pub struct OracleClient {
    backend: Arc<dyn OracleBackend>,
    deadline: Duration,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OracleClient {
    pub fn new(backend: Arc<dyn OracleBackend>, deadline: Duration) -> Self {
        Self {
            backend,
            deadline,
            shared: Arc::new(Shared {
                in_flight: AtomicBool::new(false),
                cell: Mutex::new(None),
                counters: Counters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(backend: Arc<dyn OracleBackend>, config: &OracleConfig) -> Self {
        Self::new(backend, config.deadline)
    }

    /// Dispatch an escalation unless one is already outstanding. Returns
    /// false when the request was coalesced away.
    pub fn submit(&self, request: OracleRequest) -> bool {
        if self.shared.in_flight.swap(true, Ordering::AcqRel) {
            self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %request.request_id, "escalation coalesced; request already outstanding");
            return false;
        }

        let backend = self.backend.clone();
        let shared = self.shared.clone();
        let deadline = self.deadline;
        let handle = tokio::spawn(async move {
            let request_id = request.request_id;
            match tokio::time::timeout(deadline, backend.propose(&request)).await {
                Ok(Ok(proposal)) => {
                    debug!(
                        request_id = %request_id,
                        flows = proposal.flows.len(),
                        confidence = proposal.confidence,
                        "oracle proposal received"
                    );
                    *shared.cell.lock() = Some((request_id, proposal));
                }
                Ok(Err(err)) => {
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(request_id = %request_id, error = %err, "oracle request failed");
                }
                Err(_) => {
                    // The future is dropped with the timeout, so a late
                    // response for this token can never surface.
                    shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(request_id = %request_id, "oracle request exceeded deadline");
                }
            }
            shared.in_flight.store(false, Ordering::Release);
        });
        *self.task.lock() = Some(handle);
        true
    }

    /// Non-blocking poll of the response cell; consumes the proposal.
    pub fn take_proposal(&self) -> Option<(Uuid, OracleProposal)> {
        self.shared.cell.lock().take()
    }

    pub fn outstanding(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn coalesced(&self) -> u64 {
        self.shared.counters.coalesced.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.shared.counters.timeouts.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.shared.counters.failures.load(Ordering::Relaxed)
    }

    /// Wait for any outstanding request to finish, aborting it when the
    /// grace period elapses.
    pub async fn drain(&self, grace: Duration) {
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                debug!("oracle task outlived shutdown grace; aborted");
            }
        }
    }
}
