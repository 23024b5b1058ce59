//! ---
//! mgd_section: "04-dispatch-optimization"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Dispatch allocation solver and confidence scoring."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Single-step dispatch allocation.
//!
//! The solver assigns supply-source output to consumer nodes for the next
//! tick, minimizing `sum(cost_per_amp * amps) + lambda * sum(unmet)` subject
//! to per-source capacity and ramp windows. Without the optional
//! one-source-per-node restriction the optimum is reached directly in merit
//! order; with it, a deterministic branch-and-bound runs under the solve
//! budget and falls back to its best incumbent when time runs out.

pub mod confidence;
pub mod model;
pub mod solve;

pub use confidence::{
    normalized_forecast_variance, ConfidenceGate, EscalationReason, GateWeights, TickAssessment,
};
pub use model::{
    Allocation, ConsumerDemand, ConstraintViolation, Flow, SolveError, SolveOptions, SolveOutcome,
    SolverState,
};
pub use solve::{allocation_from_flows, greedy_fallback, solve, validate_allocation};
