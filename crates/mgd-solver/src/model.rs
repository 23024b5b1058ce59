//! ---
//! mgd_section: "04-dispatch-optimization"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Dispatch allocation solver and confidence scoring."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::Duration;

use mgd_common::SourceSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numerical tolerance on amp accounting.
pub const AMP_EPSILON: f64 = 1e-6;

/// One consumer node with its single-step forecast demand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumerDemand {
    pub node_id: u8,
    pub demand: f64,
}

/// Solver tuning derived from configuration.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Restrict each consumer to at most one supplying source.
    pub single_source_per_node: bool,
    /// Penalty per amp of unmet demand. None selects 10x the highest
    /// configured cost_per_amp.
    pub unmet_penalty: Option<f64>,
    /// Hard wall-clock budget for the solve.
    pub budget: Duration,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            single_source_per_node: false,
            unmet_penalty: None,
            budget: Duration::from_millis(25),
        }
    }
}

/// Immutable view of everything the solver needs for one tick.
#[derive(Debug)]
pub struct SolverState<'a> {
    /// Consumer nodes, any order; the solver serves them in ascending id.
    pub consumers: &'a [ConsumerDemand],
    /// Source table in configuration order.
    pub sources: &'a [SourceSpec],
    /// Per-source output totals applied on the previous tick.
    pub prev_totals: &'a BTreeMap<u8, f64>,
    pub options: SolveOptions,
}

/// A single source-to-node delivery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub source_id: u8,
    pub node_id: u8,
    pub amps: f64,
}

/// How the allocation was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveOutcome {
    /// Proven optimum for the modelled problem.
    Optimal,
    /// Best incumbent found before the budget expired.
    Incumbent,
    /// Deterministic greedy fallback.
    Fallback,
}

impl SolveOutcome {
    /// True when the result is not the proven optimum.
    pub fn degraded(self) -> bool {
        !matches!(self, SolveOutcome::Optimal)
    }
}

/// Solver output for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Non-zero deliveries, ordered by (node_id, source_id).
    pub flows: Vec<Flow>,
    /// Total output per source this tick; every configured source appears.
    pub source_totals: BTreeMap<u8, f64>,
    /// Unserved demand per consumer; only non-zero entries appear.
    pub unmet: BTreeMap<u8, f64>,
    /// `sum(cost_per_amp * amps)` over all flows.
    pub supply_cost: f64,
    /// Supply cost plus the unmet-demand penalty term.
    pub objective: f64,
    pub outcome: SolveOutcome,
}

impl Allocation {
    pub fn total_supplied(&self) -> f64 {
        self.source_totals.values().sum()
    }

    pub fn total_unmet(&self) -> f64 {
        self.unmet.values().sum()
    }

    /// Amps delivered to a given node across all sources.
    pub fn delivered_to(&self, node_id: u8) -> f64 {
        self.flows
            .iter()
            .filter(|flow| flow.node_id == node_id)
            .map(|flow| flow.amps)
            .sum()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SolveError {
    /// Forced ramp-down floors exceed total demand; slack cannot absorb the
    /// surplus. The caller should apply the greedy fallback.
    #[error("infeasible: mandatory source floors exceed total demand")]
    Infeasible,
}

/// Violation raised when an externally proposed allocation breaks the
/// constraints the solver honours.
#[derive(Debug, Error, PartialEq)]
pub enum ConstraintViolation {
    #[error("allocation references unknown source {source_id}")]
    UnknownSource { source_id: u8 },
    #[error("source {source_id} over capacity: {used:.3} A > {max_capacity:.3} A")]
    CapacityExceeded {
        source_id: u8,
        used: f64,
        max_capacity: f64,
    },
    #[error("source {source_id} ramp violation: |{delta:.3}| A > {ramp_limit:.3} A/tick")]
    RampExceeded {
        source_id: u8,
        delta: f64,
        ramp_limit: f64,
    },
    #[error("flow to node {node_id} carries negative amps")]
    NegativeFlow { node_id: u8 },
}
