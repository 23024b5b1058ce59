//! ---
//! mgd_section: "04-dispatch-optimization"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Dispatch allocation solver and confidence scoring."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use mgd_common::SourceSpec;
use tracing::trace;

use crate::model::{
    Allocation, ConsumerDemand, ConstraintViolation, Flow, SolveError, SolveOptions, SolveOutcome,
    SolverState, AMP_EPSILON,
};

/// Budget checks happen every this many branch expansions.
const BUDGET_CHECK_STRIDE: usize = 512;

/// Merit order: ascending cost per amp, ties to the lower source id, then to
/// green sources.
fn merit_order(sources: &[SourceSpec]) -> Vec<&SourceSpec> {
    let mut order: Vec<&SourceSpec> = sources.iter().collect();
    order.sort_by(|a, b| {
        a.cost_per_amp
            .partial_cmp(&b.cost_per_amp)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
            .then_with(|| b.green.cmp(&a.green))
    });
    order
}

/// Feasible output range for a source this tick given its previous total.
fn output_window(spec: &SourceSpec, prev_total: f64) -> (f64, f64) {
    match spec.ramp_limit {
        Some(ramp) => {
            let hi = (prev_total + ramp).min(spec.max_capacity);
            let lo = (prev_total - ramp).max(0.0).min(hi);
            (lo, hi)
        }
        None => (0.0, spec.max_capacity),
    }
}

fn unmet_penalty(state: &SolverState) -> f64 {
    state.options.unmet_penalty.unwrap_or_else(|| {
        let max_cost = state
            .sources
            .iter()
            .map(|s| s.cost_per_amp)
            .fold(0.0, f64::max);
        (10.0 * max_cost).max(1.0)
    })
}

fn budget_spent(start: Instant, budget: Duration) -> bool {
    budget.is_zero() || start.elapsed() >= budget
}

fn sorted_consumers(state: &SolverState) -> Vec<ConsumerDemand> {
    let mut consumers: Vec<ConsumerDemand> = state
        .consumers
        .iter()
        .map(|c| ConsumerDemand {
            node_id: c.node_id,
            demand: c.demand.max(0.0),
        })
        .collect();
    consumers.sort_by_key(|c| c.node_id);
    consumers
}

fn build_allocation(
    flows: Vec<Flow>,
    unmet: BTreeMap<u8, f64>,
    sources: &[SourceSpec],
    lambda: f64,
    outcome: SolveOutcome,
) -> Allocation {
    let mut source_totals: BTreeMap<u8, f64> =
        sources.iter().map(|s| (s.source_id, 0.0)).collect();
    let mut supply_cost = 0.0;
    for flow in &flows {
        *source_totals.entry(flow.source_id).or_insert(0.0) += flow.amps;
        let cost = sources
            .iter()
            .find(|s| s.source_id == flow.source_id)
            .map(|s| s.cost_per_amp)
            .unwrap_or(0.0);
        supply_cost += cost * flow.amps;
    }
    let objective = supply_cost + lambda * unmet.values().sum::<f64>();
    Allocation {
        flows,
        source_totals,
        unmet,
        supply_cost,
        objective,
        outcome,
    }
}

/// Solve the single-step dispatch problem.
///
/// Returns `Infeasible` only when forced ramp-down floors exceed total
/// demand; the caller should then apply [`greedy_fallback`]. A solve that
/// runs out of budget degrades to its best incumbent, or to the greedy
/// fallback when no incumbent exists yet.
pub fn solve(state: &SolverState) -> Result<Allocation, SolveError> {
    let start = Instant::now();
    let consumers = sorted_consumers(state);
    let total_demand: f64 = consumers.iter().map(|c| c.demand).sum();
    let lambda = unmet_penalty(state);

    let order = merit_order(state.sources);
    let windows: BTreeMap<u8, (f64, f64)> = state
        .sources
        .iter()
        .map(|spec| {
            let prev = state.prev_totals.get(&spec.source_id).copied().unwrap_or(0.0);
            (spec.source_id, output_window(spec, prev))
        })
        .collect();

    let floor_sum: f64 = windows.values().map(|(lo, _)| lo).sum();
    if floor_sum > total_demand + AMP_EPSILON {
        return Err(SolveError::Infeasible);
    }

    if budget_spent(start, state.options.budget) {
        trace!("solve budget exhausted before search; using greedy fallback");
        return Ok(greedy_fallback(state));
    }

    if state.options.single_source_per_node {
        solve_single_source(state, &consumers, &order, &windows, lambda, start)
    } else {
        Ok(solve_merit(
            state, &consumers, &order, &windows, total_demand, lambda,
        ))
    }
}

/// Exact optimum for the relaxed (multi-source) problem: cover mandatory
/// floors, fill the rest in merit order, serve consumers in ascending id.
fn solve_merit(
    state: &SolverState,
    consumers: &[ConsumerDemand],
    order: &[&SourceSpec],
    windows: &BTreeMap<u8, (f64, f64)>,
    total_demand: f64,
    lambda: f64,
) -> Allocation {
    let mut totals: BTreeMap<u8, f64> = windows.iter().map(|(id, (lo, _))| (*id, *lo)).collect();
    let mut remaining = total_demand - totals.values().sum::<f64>();
    for spec in order {
        if remaining <= AMP_EPSILON {
            break;
        }
        let (_, hi) = windows[&spec.source_id];
        let total = totals.get_mut(&spec.source_id).expect("window for source");
        let take = (hi - *total).min(remaining).max(0.0);
        *total += take;
        remaining -= take;
    }

    // Draw each source's budget down across consumers in ascending node id.
    let mut available: Vec<(&SourceSpec, f64)> = order
        .iter()
        .map(|spec| (*spec, totals[&spec.source_id]))
        .collect();
    let mut flows = Vec::new();
    let mut unmet = BTreeMap::new();
    for consumer in consumers {
        let mut need = consumer.demand;
        for (spec, left) in available.iter_mut() {
            if need <= AMP_EPSILON {
                break;
            }
            let take = left.min(need);
            if take > AMP_EPSILON {
                flows.push(Flow {
                    source_id: spec.source_id,
                    node_id: consumer.node_id,
                    amps: take,
                });
                *left -= take;
                need -= take;
            }
        }
        if need > AMP_EPSILON {
            unmet.insert(consumer.node_id, need);
        }
    }
    flows.sort_by_key(|flow| (flow.node_id, flow.source_id));

    build_allocation(flows, unmet, state.sources, lambda, SolveOutcome::Optimal)
}

/// Branch-and-bound over per-node source assignments for the optional
/// one-source-per-node restriction.
fn solve_single_source(
    state: &SolverState,
    consumers: &[ConsumerDemand],
    order: &[&SourceSpec],
    windows: &BTreeMap<u8, (f64, f64)>,
    lambda: f64,
    start: Instant,
) -> Result<Allocation, SolveError> {
    // Largest demands first gives the bound the most leverage.
    let mut by_demand: Vec<ConsumerDemand> = consumers.to_vec();
    by_demand.sort_by(|a, b| {
        b.demand
            .partial_cmp(&a.demand)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let min_unit_cost = order
        .iter()
        .map(|s| s.cost_per_amp)
        .fold(lambda, f64::min);

    struct Search<'s> {
        consumers: Vec<ConsumerDemand>,
        order: Vec<&'s SourceSpec>,
        windows: Vec<(f64, f64)>,
        lambda: f64,
        min_unit_cost: f64,
        start: Instant,
        budget: Duration,
        expansions: usize,
        timed_out: bool,
        best: Option<(f64, Vec<Option<usize>>)>,
        assignment: Vec<Option<usize>>,
    }

    impl Search<'_> {
        fn dfs(&mut self, depth: usize, used: &mut Vec<f64>, cost: f64, remaining: f64) {
            self.expansions += 1;
            if self.expansions % BUDGET_CHECK_STRIDE == 0
                && budget_spent(self.start, self.budget)
            {
                self.timed_out = true;
            }
            if self.timed_out {
                return;
            }
            if let Some((best_cost, _)) = &self.best {
                if cost + remaining * self.min_unit_cost >= *best_cost - 1e-12 {
                    return;
                }
            }
            if depth == self.consumers.len() {
                let floors_met = used
                    .iter()
                    .zip(&self.windows)
                    .all(|(u, (lo, _))| *u + AMP_EPSILON >= *lo);
                if floors_met {
                    match &self.best {
                        Some((best_cost, _)) if *best_cost <= cost => {}
                        _ => self.best = Some((cost, self.assignment.clone())),
                    }
                }
                return;
            }

            let demand = self.consumers[depth].demand;
            for i in 0..self.order.len() {
                let (_, hi) = self.windows[i];
                let take = (hi - used[i]).min(demand).max(0.0);
                if demand > AMP_EPSILON && take <= AMP_EPSILON {
                    continue;
                }
                used[i] += take;
                self.assignment[depth] = Some(i);
                let branch_cost =
                    cost + self.order[i].cost_per_amp * take + self.lambda * (demand - take);
                self.dfs(depth + 1, used, branch_cost, remaining - demand);
                self.assignment[depth] = None;
                used[i] -= take;
                if self.timed_out {
                    return;
                }
            }
            // Leave the node unserved.
            self.assignment[depth] = None;
            self.dfs(depth + 1, used, cost + self.lambda * demand, remaining - demand);
        }
    }

    let total_demand: f64 = by_demand.iter().map(|c| c.demand).sum();
    let window_vec: Vec<(f64, f64)> = order
        .iter()
        .map(|spec| windows[&spec.source_id])
        .collect();
    let consumer_count = by_demand.len();
    let mut search = Search {
        consumers: by_demand,
        order: order.to_vec(),
        windows: window_vec,
        lambda,
        min_unit_cost,
        start,
        budget: state.options.budget,
        expansions: 0,
        timed_out: false,
        best: None,
        assignment: vec![None; consumer_count],
    };
    let mut used = vec![0.0; order.len()];
    search.dfs(0, &mut used, 0.0, total_demand);

    let timed_out = search.timed_out;
    let Some((_, assignment)) = search.best else {
        if timed_out {
            trace!("assignment search exhausted budget with no incumbent; greedy fallback");
            return Ok(greedy_fallback(state));
        }
        return Err(SolveError::Infeasible);
    };

    // Replay the winning assignment to materialize flows.
    let mut used = vec![0.0; order.len()];
    let mut flows = Vec::new();
    let mut unmet = BTreeMap::new();
    for (consumer, choice) in search.consumers.iter().zip(&assignment) {
        match choice {
            Some(i) => {
                let (_, hi) = search.windows[*i];
                let take = (hi - used[*i]).min(consumer.demand).max(0.0);
                used[*i] += take;
                if take > AMP_EPSILON {
                    flows.push(Flow {
                        source_id: search.order[*i].source_id,
                        node_id: consumer.node_id,
                        amps: take,
                    });
                }
                if consumer.demand - take > AMP_EPSILON {
                    unmet.insert(consumer.node_id, consumer.demand - take);
                }
            }
            None => {
                if consumer.demand > AMP_EPSILON {
                    unmet.insert(consumer.node_id, consumer.demand);
                }
            }
        }
    }
    flows.sort_by_key(|flow| (flow.node_id, flow.source_id));

    let outcome = if timed_out {
        SolveOutcome::Incumbent
    } else {
        SolveOutcome::Optimal
    };
    Ok(build_allocation(flows, unmet, state.sources, lambda, outcome))
}

/// Deterministic greedy fallback: sources by ascending cost per amp, fill
/// each consumer's demand in ascending node id, respecting capacity and ramp
/// ceilings.
pub fn greedy_fallback(state: &SolverState) -> Allocation {
    let consumers = sorted_consumers(state);
    let order = merit_order(state.sources);
    let lambda = unmet_penalty(state);

    let mut remaining: Vec<(&SourceSpec, f64)> = order
        .iter()
        .map(|spec| {
            let prev = state.prev_totals.get(&spec.source_id).copied().unwrap_or(0.0);
            let (_, hi) = output_window(spec, prev);
            (*spec, hi)
        })
        .collect();

    let mut flows = Vec::new();
    let mut unmet = BTreeMap::new();
    for consumer in &consumers {
        let mut need = consumer.demand;
        for (spec, headroom) in remaining.iter_mut() {
            if need <= AMP_EPSILON {
                break;
            }
            let take = headroom.min(need);
            if take > AMP_EPSILON {
                flows.push(Flow {
                    source_id: spec.source_id,
                    node_id: consumer.node_id,
                    amps: take,
                });
                *headroom -= take;
                need -= take;
            }
        }
        if need > AMP_EPSILON {
            unmet.insert(consumer.node_id, need);
        }
    }
    flows.sort_by_key(|flow| (flow.node_id, flow.source_id));

    build_allocation(flows, unmet, state.sources, lambda, SolveOutcome::Fallback)
}

/// Build an [`Allocation`] from externally supplied flows (a validated
/// oracle proposal), accounting unmet demand against the given consumer set.
pub fn allocation_from_flows(
    flows: Vec<Flow>,
    consumers: &[ConsumerDemand],
    sources: &[SourceSpec],
    options: &SolveOptions,
) -> Allocation {
    let lambda = options.unmet_penalty.unwrap_or_else(|| {
        let max_cost = sources.iter().map(|s| s.cost_per_amp).fold(0.0, f64::max);
        (10.0 * max_cost).max(1.0)
    });
    let mut unmet = BTreeMap::new();
    for consumer in consumers {
        let delivered: f64 = flows
            .iter()
            .filter(|flow| flow.node_id == consumer.node_id)
            .map(|flow| flow.amps)
            .sum();
        let shortfall = consumer.demand.max(0.0) - delivered;
        if shortfall > AMP_EPSILON {
            unmet.insert(consumer.node_id, shortfall);
        }
    }
    let mut flows = flows;
    flows.sort_by_key(|flow| (flow.node_id, flow.source_id));
    build_allocation(flows, unmet, sources, lambda, SolveOutcome::Optimal)
}

/// Check an externally proposed set of flows against the same capacity and
/// ramp constraints the solver honours. Returns the per-source totals on
/// success.
pub fn validate_allocation(
    flows: &[Flow],
    sources: &[SourceSpec],
    prev_totals: &BTreeMap<u8, f64>,
) -> Result<BTreeMap<u8, f64>, ConstraintViolation> {
    let mut totals: BTreeMap<u8, f64> = sources.iter().map(|s| (s.source_id, 0.0)).collect();
    for flow in flows {
        if flow.amps < 0.0 {
            return Err(ConstraintViolation::NegativeFlow {
                node_id: flow.node_id,
            });
        }
        match totals.get_mut(&flow.source_id) {
            Some(total) => *total += flow.amps,
            None => {
                return Err(ConstraintViolation::UnknownSource {
                    source_id: flow.source_id,
                })
            }
        }
    }
    for spec in sources {
        let used = totals[&spec.source_id];
        if used > spec.max_capacity + AMP_EPSILON {
            return Err(ConstraintViolation::CapacityExceeded {
                source_id: spec.source_id,
                used,
                max_capacity: spec.max_capacity,
            });
        }
        if let Some(ramp) = spec.ramp_limit {
            let prev = prev_totals.get(&spec.source_id).copied().unwrap_or(0.0);
            let delta = used - prev;
            if delta.abs() > ramp + AMP_EPSILON {
                return Err(ConstraintViolation::RampExceeded {
                    source_id: spec.source_id,
                    delta,
                    ramp_limit: ramp,
                });
            }
        }
    }
    Ok(totals)
}
