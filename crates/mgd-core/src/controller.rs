//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Primary dispatch loop and lifecycle management."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use mgd_common::time::unwrap_timestamp;
use mgd_common::{AppConfig, LoopTimingReporter};
use mgd_forecast::{forecast, ForecastParams, PeriodSelection};
use mgd_link::LinkHandle;
use mgd_metrics::ControllerMetrics;
use mgd_oracle::{OracleClient, OracleRequest};
use mgd_proto::{encode_dispatch, dispatch_frame_len, DispatchCommand, DispatchFrame, MAX_NODES};
use mgd_solver::{
    allocation_from_flows, greedy_fallback, solve, validate_allocation, Allocation,
    ConfidenceGate, ConsumerDemand, SolveError, SolveOptions, SolverState,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::nodes::NodeTable;
use crate::rt::RateLimiter;
use crate::snapshot::{DispatchDetail, Economics, Snapshot, SnapshotBroadcaster, SnapshotNode};

/// The closed-loop dispatch controller.
///
/// Sole mutator of the node table, solver state, and snapshot assembly; the
/// endpoint link and oracle client only touch it through their swap cells.
pub struct DispatchController {
    config: AppConfig,
    link: LinkHandle,
    oracle: Option<Arc<OracleClient>>,
    broadcaster: SnapshotBroadcaster,
    metrics: Option<ControllerMetrics>,

    nodes: NodeTable,
    gate: ConfidenceGate,
    forecast_params: ForecastParams,
    prev_totals: BTreeMap<u8, f64>,
    recent_snapshots: VecDeque<Arc<Snapshot>>,
    cumulative_cost: f64,
    tick: u64,
    /// (raw, unwrapped) endpoint timestamp of the newest accepted frame.
    last_timestamp: Option<(u32, u64)>,
    invalid_overrides: u64,
    encode_buf: Vec<u8>,
}

impl DispatchController {
    pub fn new(
        config: AppConfig,
        link: LinkHandle,
        oracle: Option<Arc<OracleClient>>,
        broadcaster: SnapshotBroadcaster,
        metrics: Option<ControllerMetrics>,
    ) -> Self {
        let forecast_params = ForecastParams {
            min_samples: config.forecast.min_samples,
            terms: config.forecast.fourier_terms,
            period: if config.forecast.detect_period {
                PeriodSelection::Detect {
                    fallback: config.forecast.period,
                }
            } else {
                PeriodSelection::Fixed(config.forecast.period)
            },
            horizon: config.forecast.horizon,
            residual_window: config.forecast.residual_window,
        };
        let prev_totals = config
            .sources
            .iter()
            .map(|s| (s.source_id, 0.0))
            .collect();
        let nodes = NodeTable::new(config.controller.history_depth);
        Self {
            link,
            oracle,
            broadcaster,
            metrics,
            nodes,
            gate: ConfidenceGate::default(),
            forecast_params,
            prev_totals,
            recent_snapshots: VecDeque::new(),
            cumulative_cost: 0.0,
            tick: 0,
            last_timestamp: None,
            invalid_overrides: 0,
            encode_buf: vec![0u8; dispatch_frame_len(MAX_NODES)],
            config,
        }
    }

    /// Spawn the loop on the runtime and return a lifecycle handle.
    pub fn spawn(self) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ControllerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Drive the pipeline until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let tick_interval = self.config.controller.tick_interval;
        let mut limiter = RateLimiter::new(tick_interval);
        let reporter = LoopTimingReporter::new(tick_interval);
        info!(
            tick_ms = tick_interval.as_millis() as u64,
            sources = self.config.sources.len(),
            "dispatch controller running"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("controller shutdown signal received");
                    break;
                }
                _ = limiter.tick() => {
                    reporter.record_tick();
                    self.run_tick();
                }
            }
        }

        self.shutdown_sequence().await;
        if let Some(summary) = reporter.histogram().summary() {
            debug!(
                samples = summary.samples,
                mean_ns = summary.mean_ns,
                std_dev_ns = summary.std_dev_ns,
                "tick jitter summary"
            );
        }
        Ok(())
    }

    fn run_tick(&mut self) {
        let now = Instant::now();
        self.tick += 1;

        // 1. Latest telemetry, if any arrived since the previous tick.
        if let Some(frame) = self.link.take_telemetry() {
            if self.accept_timestamp(frame.timestamp_ms) {
                self.nodes.observe_frame(&frame, now);
            } else {
                debug!(
                    timestamp_ms = frame.timestamp_ms,
                    "telemetry timestamp regressed; frame dropped"
                );
            }
        }

        // 2. Retire nodes that fell out of the staleness window.
        let removed = self
            .nodes
            .expire_stale(now, self.config.controller.stale_after);
        if !removed.is_empty() {
            info!(nodes = ?removed, "stale nodes retired");
        }

        // 3. Forecast every consumer at horizon h=1.
        let mut consumers = Vec::new();
        let mut variance_pairs = Vec::new();
        for (node_id, state) in self.nodes.consumers() {
            let history = state.history.to_vec();
            let projection = forecast(&history, &self.forecast_params);
            consumers.push(ConsumerDemand {
                node_id,
                demand: projection.next_tick(),
            });
            variance_pairs.push((projection.variance, state.history_mean()));
        }

        // 4. Solve under the wall-clock budget.
        let options = SolveOptions {
            single_source_per_node: self.config.solver.single_source_per_node,
            unmet_penalty: self.config.solver.unmet_penalty,
            budget: self.config.controller.solve_budget,
        };
        let state = SolverState {
            consumers: &consumers,
            sources: &self.config.sources,
            prev_totals: &self.prev_totals,
            options,
        };
        let solve_start = Instant::now();
        let solver_output = match solve(&state) {
            Ok(allocation) => allocation,
            Err(SolveError::Infeasible) => {
                warn!("solver reported infeasible state; using greedy fallback");
                greedy_fallback(&state)
            }
        };
        let solve_time = solve_start.elapsed();

        // 5. Confidence score and escalation policy.
        let normalized_variance =
            mgd_solver::normalized_forecast_variance(variance_pairs.iter().copied());
        let assessment = self
            .gate
            .assess(&solver_output, &self.config.sources, normalized_variance);

        // 6. A validated oracle proposal overrides the solver for this tick
        //    only. Proposals are polled here, so one received during tick K
        //    is first observable at K+1.
        let mut chosen = solver_output.clone();
        let mut oracle_override = false;
        if let Some(oracle) = &self.oracle {
            if let Some((request_id, proposal)) = oracle.take_proposal() {
                match validate_allocation(
                    &proposal.flows,
                    &self.config.sources,
                    &self.prev_totals,
                ) {
                    Ok(_) => {
                        info!(
                            request_id = %request_id,
                            flows = proposal.flows.len(),
                            confidence = proposal.confidence,
                            "applying oracle override for this tick"
                        );
                        chosen = allocation_from_flows(
                            proposal.flows,
                            &consumers,
                            &self.config.sources,
                            &state.options,
                        );
                        oracle_override = true;
                    }
                    Err(violation) => {
                        self.invalid_overrides += 1;
                        warn!(request_id = %request_id, error = %violation, "oracle override rejected");
                    }
                }
            }

            // 7. Fire a single-flight escalation when the gate demands one.
            if assessment.escalate && !oracle.outstanding() {
                let request = OracleRequest {
                    request_id: Uuid::new_v4(),
                    snapshots: self
                        .recent_snapshots
                        .iter()
                        .filter_map(|snapshot| serde_json::to_value(snapshot.as_ref()).ok())
                        .collect(),
                    sources: self.config.sources.clone(),
                    rejected_flows: solver_output.flows.clone(),
                    confidence: assessment.confidence,
                };
                if oracle.submit(request) {
                    debug!(reasons = ?assessment.reasons, "escalation dispatched to oracle");
                }
            }
        }

        // 8. Exactly one dispatch encoding per tick.
        let link_up = self.link.is_up();
        let (dispatch, details) = self.dispatch_from_allocation(&chosen);
        match encode_dispatch(&dispatch, &mut self.encode_buf) {
            Ok(written) => {
                if link_up {
                    self.link.send_dispatch(self.encode_buf[..written].to_vec());
                }
                // While the link is down the dispatch is computed but not
                // transmitted.
            }
            Err(err) => error!(error = %err, "dispatch encoding failed; tick skipped transmission"),
        }

        // 9. Assemble and publish the snapshot.
        let total_demand: f64 = consumers.iter().map(|c| c.demand).sum();
        self.cumulative_cost += chosen.supply_cost;
        let economic = Economics::from_allocation(
            &chosen,
            &self.config.sources,
            details,
            total_demand,
            self.cumulative_cost,
            self.config.controller.tick_interval,
        );
        let snapshot = Snapshot {
            tick: self.tick,
            timestamp_ms: self.last_timestamp.map(|(raw, _)| raw).unwrap_or(0),
            captured_at: Utc::now(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, state)| SnapshotNode {
                    id,
                    kind: state.kind,
                    demand: state.last_demand,
                    fulfillment: state.last_fulfillment,
                })
                .collect(),
            optimization_time_ms: solve_time.as_secs_f64() * 1_000.0,
            confidence_score: assessment.confidence,
            dispatch_count: dispatch.commands.len(),
            link_down: !link_up,
            solver_fallback: solver_output.outcome.degraded(),
            escalating: assessment.escalate,
            oracle_override,
            economic,
        };
        let shared = self.broadcaster.publish(snapshot);
        let history_cap = self
            .config
            .oracle
            .as_ref()
            .map(|o| o.snapshot_history)
            .unwrap_or(10)
            .max(1);
        while self.recent_snapshots.len() >= history_cap {
            self.recent_snapshots.pop_front();
        }
        self.recent_snapshots.push_back(shared);

        // The ramp baseline for the next tick is what this tick applied.
        self.prev_totals = chosen.source_totals.clone();

        self.update_metrics(&solver_output, &assessment, solve_time, link_up, oracle_override);
    }

    /// Accept a frame timestamp when it does not regress the unwrapped
    /// sequence; regressed frames are treated as stale duplicates.
    fn accept_timestamp(&mut self, raw: u32) -> bool {
        match self.last_timestamp {
            None => {
                self.last_timestamp = Some((raw, u64::from(raw)));
                true
            }
            Some((_, unwrapped)) => {
                let candidate = unwrap_timestamp(unwrapped, raw);
                if candidate < unwrapped {
                    false
                } else {
                    self.last_timestamp = Some((raw, candidate));
                    true
                }
            }
        }
    }

    /// Collapse an allocation into wire commands: one command per node with
    /// the aggregate amps normalized against the node's reference current,
    /// attributed to the dominant source.
    fn dispatch_from_allocation(
        &self,
        allocation: &Allocation,
    ) -> (DispatchFrame, Vec<DispatchDetail>) {
        let mut per_node: BTreeMap<u8, BTreeMap<u8, f64>> = BTreeMap::new();
        for flow in &allocation.flows {
            *per_node
                .entry(flow.node_id)
                .or_default()
                .entry(flow.source_id)
                .or_insert(0.0) += flow.amps;
        }

        let mut commands = Vec::new();
        let mut details = Vec::new();
        for (node_id, by_source) in per_node {
            let total: f64 = by_source.values().sum();
            let source_id = by_source
                .iter()
                .max_by(|a, b| {
                    a.1.partial_cmp(b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.0.cmp(a.0))
                })
                .map(|(id, _)| *id)
                .unwrap_or(0);
            let nominal = self.config.solver.nominal_for(node_id);
            commands.push(DispatchCommand {
                node_id,
                supply: (total / nominal).clamp(0.0, 1.0) as f32,
                source_id,
            });
            details.push(DispatchDetail {
                id: node_id,
                supply_amps: total,
                source_id,
            });
        }
        if commands.len() > MAX_NODES {
            warn!(
                commands = commands.len(),
                "dispatch exceeds frame capacity; truncating to {MAX_NODES} lowest node ids"
            );
            commands.truncate(MAX_NODES);
            details.truncate(MAX_NODES);
        }
        (DispatchFrame { commands }, details)
    }

    fn update_metrics(
        &self,
        solver_output: &Allocation,
        assessment: &mgd_solver::TickAssessment,
        solve_time: Duration,
        link_up: bool,
        oracle_override: bool,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.ticks.inc();
        metrics.solve_seconds.observe(solve_time.as_secs_f64());
        metrics.confidence.set(assessment.confidence);
        metrics.link_up.set(i64::from(link_up));
        metrics.active_nodes.set(self.nodes.len() as i64);
        if solver_output.outcome.degraded() {
            metrics.solver_fallbacks.inc();
        }
        if assessment.escalate {
            metrics.escalations.inc();
        }
        if oracle_override {
            metrics.oracle_overrides.inc();
        }
        ControllerMetrics::sync_counter(&metrics.bad_frames, self.link.counters().bad_frames());
        if let Some(oracle) = &self.oracle {
            ControllerMetrics::sync_counter(&metrics.oracle_timeouts, oracle.timeouts());
        }
    }

    /// Best-effort zero-demand dispatch, then drain background tasks within
    /// the shutdown grace period.
    async fn shutdown_sequence(self) {
        let grace = self.config.controller.shutdown_grace;
        info!(
            ticks = self.tick,
            invalid_overrides = self.invalid_overrides,
            "controller stopping; issuing zero-demand dispatch"
        );

        let consumer_ids: Vec<u8> = self.nodes.consumer_ids().into_iter().take(MAX_NODES).collect();
        let frame = DispatchFrame::zero_for(consumer_ids);
        let mut buf = vec![0u8; dispatch_frame_len(frame.commands.len())];
        match encode_dispatch(&frame, &mut buf) {
            Ok(written) => {
                self.link.send_dispatch(buf[..written].to_vec());
                // Give the writer task a moment to flush before teardown.
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => warn!(error = %err, "failed to encode shutdown dispatch"),
        }

        if let Some(oracle) = &self.oracle {
            oracle.drain(grace).await;
        }
        self.link.shutdown(grace).await;
        info!("controller shutdown complete");
    }
}

/// Lifecycle handle returned by [`DispatchController::spawn`].
pub struct ControllerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ControllerHandle {
    /// Signal shutdown and wait for the loop to wind down.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await??;
        Ok(())
    }
}
