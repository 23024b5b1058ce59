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
use std::time::{Duration, Instant};

use mgd_forecast::HistoryBuffer;
use mgd_proto::{NodeKind, TelemetryFrame};
use tracing::{debug, warn};

/// Live state for one node sighted in telemetry.
#[derive(Debug)]
pub struct NodeState {
    pub kind: NodeKind,
    pub last_seen: Instant,
    pub last_demand: f64,
    pub last_fulfillment: f64,
    pub history: HistoryBuffer,
}

impl NodeState {
    /// Mean of the stored demand history, zero when empty.
    pub fn history_mean(&self) -> f64 {
        let samples = self.history.to_vec();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }
}

/// Node registry keyed by id. Iteration is always in ascending id so
/// downstream tie-breaks stay stable. Owned exclusively by the tick loop.
#[derive(Debug)]
pub struct NodeTable {
    nodes: BTreeMap<u8, NodeState>,
    history_depth: usize,
}

impl NodeTable {
    pub fn new(history_depth: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            history_depth,
        }
    }

    /// Fold one telemetry frame into the table: create nodes on first
    /// sighting, refresh liveness, append consumer demand history.
    pub fn observe_frame(&mut self, frame: &TelemetryFrame, now: Instant) {
        let history_depth = self.history_depth;
        for reading in &frame.nodes {
            let state = self.nodes.entry(reading.id).or_insert_with(|| {
                debug!(node_id = reading.id, kind = ?reading.kind, "node sighted");
                NodeState {
                    kind: reading.kind,
                    last_seen: now,
                    last_demand: 0.0,
                    last_fulfillment: 0.0,
                    history: HistoryBuffer::new(history_depth),
                }
            });
            if state.kind != reading.kind {
                // Roles are immutable for a run; a flipped tag is endpoint
                // misbehaviour, not a role change.
                warn!(node_id = reading.id, was = ?state.kind, now = ?reading.kind, "node type tag changed mid-run; keeping original");
            }
            state.last_seen = now;
            state.last_demand = f64::from(reading.demand).max(0.0);
            state.last_fulfillment = f64::from(reading.fulfillment).max(0.0);
            if state.kind.is_consumer() {
                state.history.push(state.last_demand);
            }
        }
    }

    /// Retire nodes unseen for longer than `stale_after`, returning their ids.
    pub fn expire_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<u8> {
        let stale: Vec<u8> = self
            .nodes
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_seen) > stale_after)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.nodes.remove(id);
            debug!(node_id = id, "node retired as stale");
        }
        stale
    }

    /// All nodes in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &NodeState)> {
        self.nodes.iter().map(|(id, state)| (*id, state))
    }

    /// Consumer nodes in ascending id order.
    pub fn consumers(&self) -> impl Iterator<Item = (u8, &NodeState)> {
        self.iter().filter(|(_, state)| state.kind.is_consumer())
    }

    pub fn consumer_ids(&self) -> Vec<u8> {
        self.consumers().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgd_proto::TelemetryNode;

    fn frame(nodes: Vec<TelemetryNode>) -> TelemetryFrame {
        TelemetryFrame {
            timestamp_ms: 0,
            nodes,
        }
    }

    fn consumer(id: u8, demand: f32) -> TelemetryNode {
        TelemetryNode {
            id,
            kind: NodeKind::Consumer,
            demand,
            fulfillment: demand,
        }
    }

    #[test]
    fn nodes_are_created_on_first_sighting_and_iterate_in_id_order() {
        let mut table = NodeTable::new(16);
        let now = Instant::now();
        table.observe_frame(
            &frame(vec![
                consumer(5, 1.0),
                consumer(3, 2.0),
                TelemetryNode {
                    id: 1,
                    kind: NodeKind::Power,
                    demand: 0.0,
                    fulfillment: 4.0,
                },
            ]),
            now,
        );
        let ids: Vec<u8> = table.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(table.consumer_ids(), vec![3, 5]);
    }

    #[test]
    fn consumer_history_follows_demand() {
        let mut table = NodeTable::new(16);
        let now = Instant::now();
        for demand in [1.0, 2.0, 3.0] {
            table.observe_frame(&frame(vec![consumer(3, demand)]), now);
        }
        let (_, state) = table.consumers().next().unwrap();
        assert_eq!(state.history.to_vec(), vec![1.0, 2.0, 3.0]);
        assert!((state.history_mean() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn negative_demand_is_clamped() {
        let mut table = NodeTable::new(16);
        table.observe_frame(&frame(vec![consumer(3, -2.0)]), Instant::now());
        let (_, state) = table.consumers().next().unwrap();
        assert_eq!(state.last_demand, 0.0);
        assert_eq!(state.history.to_vec(), vec![0.0]);
    }

    #[test]
    fn stale_nodes_are_retired() {
        let mut table = NodeTable::new(16);
        let start = Instant::now();
        table.observe_frame(&frame(vec![consumer(3, 1.0), consumer(4, 1.0)]), start);

        let later = start + Duration::from_millis(6000);
        table.observe_frame(&frame(vec![consumer(3, 1.5)]), later);
        let removed = table.expire_stale(later, Duration::from_millis(5000));
        assert_eq!(removed, vec![4]);
        assert_eq!(table.consumer_ids(), vec![3]);
    }

    #[test]
    fn role_tag_flips_are_ignored() {
        let mut table = NodeTable::new(16);
        let now = Instant::now();
        table.observe_frame(&frame(vec![consumer(3, 1.0)]), now);
        table.observe_frame(
            &frame(vec![TelemetryNode {
                id: 3,
                kind: NodeKind::Power,
                demand: 0.0,
                fulfillment: 1.0,
            }]),
            now,
        );
        let (_, state) = table.iter().next().unwrap();
        assert_eq!(state.kind, NodeKind::Consumer);
    }
}
