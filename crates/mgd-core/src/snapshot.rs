//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Primary dispatch loop and lifecycle management."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mgd_common::SourceSpec;
use mgd_proto::NodeKind;
use mgd_solver::Allocation;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// One node reading as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: u8,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub demand: f64,
    pub fulfillment: f64,
}

/// Per-source usage for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceUsage {
    pub amps: f64,
    pub cost: f64,
    pub cost_per_amp: f64,
    pub max_capacity: f64,
}

/// One emitted supply command, mirroring the dispatch frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchDetail {
    pub id: u8,
    pub supply_amps: f64,
    pub source_id: u8,
}

/// Aggregated cost and energy figures for one tick.
///
/// `total_cost` is cumulative across the run; `cost_per_second` is the
/// instantaneous spend rate derived from this cycle's cost and the tick
/// cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Economics {
    pub total_cost: f64,
    pub cycle_cost: f64,
    pub cost_per_second: f64,
    pub cost_per_amp: f64,
    pub total_demand: f64,
    pub total_supply: f64,
    pub unmet_demand: f64,
    pub efficiency_percent: f64,
    pub green_energy_percent: f64,
    pub source_usage: BTreeMap<u8, SourceUsage>,
    pub dispatch_details: Vec<DispatchDetail>,
}

impl Economics {
    /// Derive the economic block from an allocation and the emitted
    /// dispatch details.
    pub fn from_allocation(
        allocation: &Allocation,
        sources: &[SourceSpec],
        dispatch_details: Vec<DispatchDetail>,
        total_demand: f64,
        cumulative_cost: f64,
        tick_interval: Duration,
    ) -> Self {
        let cycle_cost = allocation.supply_cost;
        let total_supply = allocation.total_supplied();
        let unmet_demand = allocation.total_unmet();

        let mut source_usage = BTreeMap::new();
        let mut green_amps = 0.0;
        for spec in sources {
            let amps = allocation
                .source_totals
                .get(&spec.source_id)
                .copied()
                .unwrap_or(0.0);
            if spec.green {
                green_amps += amps;
            }
            source_usage.insert(
                spec.source_id,
                SourceUsage {
                    amps,
                    cost: amps * spec.cost_per_amp,
                    cost_per_amp: spec.cost_per_amp,
                    max_capacity: spec.max_capacity,
                },
            );
        }

        let cost_per_amp = if total_supply > 1e-9 {
            cycle_cost / total_supply
        } else {
            0.0
        };
        let efficiency_percent = if total_demand > 1e-9 {
            (total_supply / total_demand * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        let green_energy_percent = if total_supply > 1e-9 {
            (green_amps / total_supply * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let cost_per_second = if tick_interval.as_secs_f64() > 0.0 {
            cycle_cost / tick_interval.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_cost: cumulative_cost,
            cycle_cost,
            cost_per_second,
            cost_per_amp,
            total_demand,
            total_supply,
            unmet_demand,
            efficiency_percent,
            green_energy_percent,
            source_usage,
            dispatch_details,
        }
    }
}

/// The publishable aggregated state for one tick. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,
    /// Endpoint timestamp of the telemetry this tick was computed from.
    pub timestamp_ms: u32,
    pub captured_at: DateTime<Utc>,
    pub nodes: Vec<SnapshotNode>,
    pub optimization_time_ms: f64,
    pub confidence_score: f64,
    pub dispatch_count: usize,
    pub link_down: bool,
    pub solver_fallback: bool,
    pub escalating: bool,
    pub oracle_override: bool,
    pub economic: Economics,
}

/// Single latest-value snapshot cell: one writer (the tick loop), many
/// readers. Reads never block the writer and there is no backlog.
#[derive(Debug, Clone)]
pub struct SnapshotBroadcaster {
    tx: Arc<watch::Sender<Option<Arc<Snapshot>>>>,
}

impl SnapshotBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a snapshot, replacing the previous one.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let shared = Arc::new(snapshot);
        let _ = self.tx.send(Some(shared.clone()));
        shared
    }

    /// Current snapshot, or None before the first tick completes.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.tx.borrow().clone()
    }

    /// Subscribe for push-style observation (used by the WebSocket stream).
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.tx.subscribe()
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
