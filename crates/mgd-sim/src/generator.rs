//! ---
//! mgd_section: "11-simulation-test-harness"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Synthetic telemetry and endpoint emulation."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::f64::consts::TAU;

use mgd_proto::{NodeKind, TelemetryFrame, TelemetryNode};
use rand::prelude::*;
use rand_distr::Normal;

/// Demand oscillation of consumer nodes, matching the reference hardware's
/// dummy generator: sinusoidal between 0.5 and 4.0 A.
const DEMAND_BASE: f64 = 2.25;
const DEMAND_AMPLITUDE: f64 = 1.75;
const DEMAND_FREQ_HZ: f64 = 0.08;
const FULFILLMENT_FREQ_HZ: f64 = 0.12;
/// Per-node phase offset so the waveforms do not move in lockstep.
const PHASE_STEP: f64 = 0.5;

/// Seeded synthetic telemetry source.
#[derive(Debug)]
pub struct TelemetryGenerator {
    power_nodes: usize,
    consumer_nodes: usize,
    tick_seconds: f64,
    rng: StdRng,
    noise: Normal<f64>,
}

impl TelemetryGenerator {
    /// Node ids are assigned sequentially: power nodes first, consumers
    /// after, starting at 1.
    pub fn new(power_nodes: usize, consumer_nodes: usize, tick_seconds: f64, seed: u64) -> Self {
        Self {
            power_nodes,
            consumer_nodes,
            tick_seconds,
            rng: StdRng::seed_from_u64(seed),
            noise: Normal::new(0.0, 0.05).expect("sigma must be positive"),
        }
    }

    /// Telemetry frame for the given tick number.
    pub fn frame_at(&mut self, tick: u64) -> TelemetryFrame {
        let time_s = tick as f64 * self.tick_seconds;
        let timestamp_ms = (time_s * 1000.0) as u32;

        let mut nodes = Vec::with_capacity(self.power_nodes + self.consumer_nodes);
        for index in 0..self.power_nodes {
            let phase = index as f64 * PHASE_STEP;
            let fulfillment = 0.9 + 0.1 * (TAU * 0.06 * time_s + phase + 2.0).sin();
            nodes.push(TelemetryNode {
                id: (index + 1) as u8,
                kind: NodeKind::Power,
                demand: 0.0,
                fulfillment: fulfillment.max(0.0) as f32,
            });
        }
        for index in 0..self.consumer_nodes {
            let phase = (self.power_nodes + index) as f64 * PHASE_STEP;
            let demand = DEMAND_BASE
                + DEMAND_AMPLITUDE * (TAU * DEMAND_FREQ_HZ * time_s + phase).sin()
                + self.noise.sample(&mut self.rng);
            let fulfillment =
                0.85 + 0.15 * (TAU * FULFILLMENT_FREQ_HZ * time_s + phase + 1.0).sin();
            nodes.push(TelemetryNode {
                id: (self.power_nodes + index + 1) as u8,
                kind: NodeKind::Consumer,
                demand: demand.max(0.0) as f32,
                fulfillment: fulfillment.max(0.0) as f32,
            });
        }

        TelemetryFrame {
            timestamp_ms,
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_deterministic_for_a_seed() {
        let mut a = TelemetryGenerator::new(1, 3, 1.0 / 24.0, 42);
        let mut b = TelemetryGenerator::new(1, 3, 1.0 / 24.0, 42);
        for tick in 0..50 {
            assert_eq!(a.frame_at(tick), b.frame_at(tick));
        }
    }

    #[test]
    fn consumer_demand_stays_in_the_expected_band() {
        let mut generator = TelemetryGenerator::new(0, 4, 1.0 / 24.0, 7);
        for tick in 0..500 {
            let frame = generator.frame_at(tick);
            for node in &frame.nodes {
                assert!(node.kind.is_consumer());
                assert!(node.demand >= 0.0);
                assert!(node.demand < 4.5, "demand {} out of band", node.demand);
            }
        }
    }

    #[test]
    fn power_nodes_report_zero_demand() {
        let mut generator = TelemetryGenerator::new(2, 2, 1.0 / 24.0, 1);
        let frame = generator.frame_at(10);
        assert_eq!(frame.nodes[0].kind, NodeKind::Power);
        assert_eq!(frame.nodes[0].demand, 0.0);
        assert_eq!(frame.nodes[1].demand, 0.0);
    }

    #[test]
    fn timestamps_advance_with_ticks() {
        let mut generator = TelemetryGenerator::new(0, 1, 1.0 / 24.0, 3);
        let first = generator.frame_at(1).timestamp_ms;
        let later = generator.frame_at(100).timestamp_ms;
        assert!(later > first);
    }
}
