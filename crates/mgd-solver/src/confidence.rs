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

use mgd_common::SourceSpec;
use serde::{Deserialize, Serialize};

use crate::model::{Allocation, AMP_EPSILON};

/// Fraction of capacity at which a source counts as near its limit.
const NEAR_CAPACITY_FRACTION: f64 = 0.95;
/// Consecutive near-capacity ticks before the gate escalates.
const NEAR_CAPACITY_STREAK: u32 = 2;
/// Confidence below this threshold escalates.
const CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Weights of the three confidence terms; must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateWeights {
    pub feasibility: f64,
    pub variance: f64,
    pub headroom: f64,
}

impl Default for GateWeights {
    fn default() -> Self {
        Self {
            feasibility: 0.5,
            variance: 0.3,
            headroom: 0.2,
        }
    }
}

/// Why a tick escalated to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence,
    SolverDegraded,
    SourceNearCapacity { source_id: u8 },
}

/// Gate verdict for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickAssessment {
    /// Score in [0, 1].
    pub confidence: f64,
    pub escalate: bool,
    pub reasons: Vec<EscalationReason>,
}

/// Demand-normalized mean residual variance over the consumer set, clamped
/// to [0, 1]. Pairs are (residual variance, mean historical demand); the +1
/// floor keeps near-idle nodes from saturating the term.
pub fn normalized_forecast_variance(pairs: impl IntoIterator<Item = (f64, f64)>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (variance, mean_demand) in pairs {
        sum += (variance / (mean_demand * mean_demand + 1.0)).clamp(0.0, 1.0);
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).clamp(0.0, 1.0)
    }
}

/// Confidence scorer with per-source near-capacity streak memory.
#[derive(Debug)]
pub struct ConfidenceGate {
    weights: GateWeights,
    near_cap_streaks: BTreeMap<u8, u32>,
}

impl ConfidenceGate {
    pub fn new(weights: GateWeights) -> Self {
        Self {
            weights,
            near_cap_streaks: BTreeMap::new(),
        }
    }

    /// Score the tick and decide whether to escalate.
    ///
    /// The dispatch for this tick is emitted regardless; escalation only
    /// requests an overriding allocation for a later tick.
    pub fn assess(
        &mut self,
        allocation: &Allocation,
        sources: &[SourceSpec],
        normalized_variance: f64,
    ) -> TickAssessment {
        let feasibility = if allocation.total_unmet() <= AMP_EPSILON {
            1.0
        } else {
            0.0
        };

        let headroom = sources
            .iter()
            .map(|spec| {
                let used = allocation
                    .source_totals
                    .get(&spec.source_id)
                    .copied()
                    .unwrap_or(0.0);
                (1.0 - used / spec.max_capacity).max(0.0)
            })
            .fold(1.0, f64::min);

        let confidence = (self.weights.feasibility * feasibility
            + self.weights.variance * (1.0 - normalized_variance.clamp(0.0, 1.0))
            + self.weights.headroom * headroom)
            .clamp(0.0, 1.0);

        let mut reasons = Vec::new();
        if confidence < CONFIDENCE_THRESHOLD {
            reasons.push(EscalationReason::LowConfidence);
        }
        if allocation.outcome.degraded() {
            reasons.push(EscalationReason::SolverDegraded);
        }
        for spec in sources {
            let used = allocation
                .source_totals
                .get(&spec.source_id)
                .copied()
                .unwrap_or(0.0);
            let streak = self.near_cap_streaks.entry(spec.source_id).or_insert(0);
            if used >= NEAR_CAPACITY_FRACTION * spec.max_capacity {
                *streak += 1;
                if *streak >= NEAR_CAPACITY_STREAK {
                    reasons.push(EscalationReason::SourceNearCapacity {
                        source_id: spec.source_id,
                    });
                }
            } else {
                *streak = 0;
            }
        }

        TickAssessment {
            confidence,
            escalate: !reasons.is_empty(),
            reasons,
        }
    }
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self::new(GateWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SolveOutcome;

    fn source(id: u8, cap: f64) -> SourceSpec {
        SourceSpec {
            source_id: id,
            max_capacity: cap,
            cost_per_amp: 0.10,
            ramp_limit: None,
            green: false,
        }
    }

    fn allocation(totals: &[(u8, f64)], unmet: &[(u8, f64)], outcome: SolveOutcome) -> Allocation {
        Allocation {
            flows: Vec::new(),
            source_totals: totals.iter().copied().collect(),
            unmet: unmet.iter().copied().collect(),
            supply_cost: 0.0,
            objective: 0.0,
            outcome,
        }
    }

    #[test]
    fn healthy_tick_scores_high_and_stays_quiet() {
        let mut gate = ConfidenceGate::default();
        let sources = [source(1, 10.0)];
        let alloc = allocation(&[(1, 2.0)], &[], SolveOutcome::Optimal);
        let verdict = gate.assess(&alloc, &sources, 0.05);
        assert!(verdict.confidence > 0.8);
        assert!(!verdict.escalate);
    }

    #[test]
    fn unmet_demand_drops_confidence_below_threshold() {
        let mut gate = ConfidenceGate::default();
        let sources = [source(1, 5.0), source(2, 5.0)];
        let alloc = allocation(&[(1, 5.0), (2, 5.0)], &[(4, 2.0)], SolveOutcome::Optimal);
        let verdict = gate.assess(&alloc, &sources, 0.0);
        // Feasibility zeroed and headroom gone: only the variance term remains.
        assert!(verdict.confidence < 0.5);
        assert!(verdict.escalate);
        assert!(verdict.reasons.contains(&EscalationReason::LowConfidence));
    }

    #[test]
    fn degraded_solver_outcome_escalates_at_any_confidence() {
        let mut gate = ConfidenceGate::default();
        let sources = [source(1, 10.0)];
        let alloc = allocation(&[(1, 1.0)], &[], SolveOutcome::Fallback);
        let verdict = gate.assess(&alloc, &sources, 0.0);
        assert!(verdict.confidence > 0.5);
        assert!(verdict.escalate);
        assert!(verdict.reasons.contains(&EscalationReason::SolverDegraded));
    }

    #[test]
    fn near_capacity_needs_two_consecutive_ticks() {
        let mut gate = ConfidenceGate::default();
        let sources = [source(1, 5.0), source(2, 100.0)];
        let hot = allocation(&[(1, 4.9), (2, 1.0)], &[], SolveOutcome::Optimal);

        let first = gate.assess(&hot, &sources, 0.0);
        assert!(!first
            .reasons
            .iter()
            .any(|r| matches!(r, EscalationReason::SourceNearCapacity { .. })));

        let second = gate.assess(&hot, &sources, 0.0);
        assert!(second
            .reasons
            .contains(&EscalationReason::SourceNearCapacity { source_id: 1 }));
        assert!(second.escalate);
    }

    #[test]
    fn near_capacity_streak_resets_when_load_drops() {
        let mut gate = ConfidenceGate::default();
        let sources = [source(1, 5.0)];
        let hot = allocation(&[(1, 4.9)], &[], SolveOutcome::Optimal);
        let cool = allocation(&[(1, 1.0)], &[], SolveOutcome::Optimal);

        gate.assess(&hot, &sources, 0.0);
        gate.assess(&cool, &sources, 0.0);
        let third = gate.assess(&hot, &sources, 0.0);
        assert!(!third
            .reasons
            .iter()
            .any(|r| matches!(r, EscalationReason::SourceNearCapacity { .. })));
    }

    #[test]
    fn variance_helper_clamps_and_averages() {
        assert_eq!(normalized_forecast_variance([]), 0.0);
        let value = normalized_forecast_variance([(0.5, 2.0), (100.0, 0.0)]);
        // Second pair clamps to 1.0, first is 0.5 / 5.0 = 0.1.
        assert!((value - 0.55).abs() < 1e-9);
    }
}
