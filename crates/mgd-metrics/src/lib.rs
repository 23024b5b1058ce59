//! ---
//! mgd_section: "03-observability"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Metrics collection and export utilities."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metric families maintained by the tick loop.
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    pub ticks: IntCounter,
    pub solver_fallbacks: IntCounter,
    pub escalations: IntCounter,
    pub oracle_timeouts: IntCounter,
    pub oracle_overrides: IntCounter,
    pub bad_frames: IntCounter,
    pub link_up: IntGauge,
    pub active_nodes: IntGauge,
    pub solve_seconds: Histogram,
    pub confidence: prometheus::Gauge,
}

impl ControllerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let ticks = IntCounter::with_opts(Opts::new("mgd_ticks_total", "Completed ticks"))?;
        let solver_fallbacks = IntCounter::with_opts(Opts::new(
            "mgd_solver_fallbacks_total",
            "Ticks that used the greedy fallback or a budget incumbent",
        ))?;
        let escalations = IntCounter::with_opts(Opts::new(
            "mgd_escalations_total",
            "Ticks escalated to the oracle",
        ))?;
        let oracle_timeouts = IntCounter::with_opts(Opts::new(
            "mgd_oracle_timeouts_total",
            "Oracle requests that exceeded their deadline",
        ))?;
        let oracle_overrides = IntCounter::with_opts(Opts::new(
            "mgd_oracle_overrides_total",
            "Ticks dispatched from a validated oracle proposal",
        ))?;
        let bad_frames = IntCounter::with_opts(Opts::new(
            "mgd_bad_frames_total",
            "Malformed telemetry frames dropped by the link",
        ))?;
        let link_up = IntGauge::with_opts(Opts::new(
            "mgd_link_up",
            "Whether the endpoint link is connected",
        ))?;
        let active_nodes = IntGauge::with_opts(Opts::new(
            "mgd_active_nodes",
            "Nodes currently tracked by the controller",
        ))?;
        let solve_seconds = Histogram::with_opts(
            HistogramOpts::new("mgd_solve_seconds", "Dispatch solve wall time").buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100,
            ]),
        )?;
        let confidence = prometheus::Gauge::with_opts(Opts::new(
            "mgd_confidence_score",
            "Confidence score of the latest tick",
        ))?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(solver_fallbacks.clone()))?;
        registry.register(Box::new(escalations.clone()))?;
        registry.register(Box::new(oracle_timeouts.clone()))?;
        registry.register(Box::new(oracle_overrides.clone()))?;
        registry.register(Box::new(bad_frames.clone()))?;
        registry.register(Box::new(link_up.clone()))?;
        registry.register(Box::new(active_nodes.clone()))?;
        registry.register(Box::new(solve_seconds.clone()))?;
        registry.register(Box::new(confidence.clone()))?;

        Ok(Self {
            ticks,
            solver_fallbacks,
            escalations,
            oracle_timeouts,
            oracle_overrides,
            bad_frames,
            link_up,
            active_nodes,
            solve_seconds,
            confidence,
        })
    }

    /// Bring the monotone counters sourced from link/oracle atomics up to
    /// the given absolute values.
    pub fn sync_counter(counter: &IntCounter, absolute: u64) {
        let current = counter.get();
        if absolute > current {
            counter.inc_by(absolute - current);
        }
    }
}
