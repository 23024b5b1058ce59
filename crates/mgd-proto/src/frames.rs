//! ---
//! mgd_section: "02-wire-protocol"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Binary frame layouts and codec for the endpoint link."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Role of a node as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Power,
    Consumer,
}

impl NodeKind {
    pub fn to_wire(self) -> u8 {
        match self {
            NodeKind::Power => 0,
            NodeKind::Consumer => 1,
        }
    }

    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(NodeKind::Power),
            1 => Some(NodeKind::Consumer),
            _ => None,
        }
    }

    pub fn is_consumer(self) -> bool {
        matches!(self, NodeKind::Consumer)
    }
}

/// Single node reading inside a telemetry frame. 10 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryNode {
    pub id: u8,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Instantaneous demand in amps. Power nodes report zero.
    pub demand: f32,
    /// Amps actually delivered, as reported by the endpoint.
    pub fulfillment: f32,
}

/// One telemetry reading from the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Monotonic endpoint clock in milliseconds. Wraps at u32::MAX.
    pub timestamp_ms: u32,
    pub nodes: Vec<TelemetryNode>,
}

impl TelemetryFrame {
    pub fn consumers(&self) -> impl Iterator<Item = &TelemetryNode> {
        self.nodes.iter().filter(|node| node.kind.is_consumer())
    }
}

/// Single supply command inside a dispatch frame. 6 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub node_id: u8,
    /// Normalized PWM level in [0, 1].
    pub supply: f32,
    pub source_id: u8,
}

/// One command set sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispatchFrame {
    pub commands: Vec<DispatchCommand>,
}

impl DispatchFrame {
    /// A zero-supply command set for the given nodes, used as the best-effort
    /// shutdown dispatch.
    pub fn zero_for(node_ids: impl IntoIterator<Item = u8>) -> Self {
        Self {
            commands: node_ids
                .into_iter()
                .map(|node_id| DispatchCommand {
                    node_id,
                    supply: 0.0,
                    source_id: 0,
                })
                .collect(),
        }
    }
}
