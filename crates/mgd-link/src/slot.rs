//! ---
//! mgd_section: "05-networking-external-interfaces"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Persistent duplex stream to the hardware endpoint."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::sync::Arc;

use mgd_proto::TelemetryFrame;
use parking_lot::Mutex;

/// Latest-only telemetry cell between the link reader and the tick loop.
///
/// Single producer, single consumer, swap semantics: a publish replaces any
/// unread frame (older frames are dropped, latest wins) and a take empties
/// the slot.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySlot {
    inner: Arc<Mutex<Option<TelemetryFrame>>>,
}

impl TelemetrySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot contents, returning true when an unread frame was
    /// dropped.
    pub fn publish(&self, frame: TelemetryFrame) -> bool {
        self.inner.lock().replace(frame).is_some()
    }

    /// Take the most recent frame, if any.
    pub fn take(&self) -> Option<TelemetryFrame> {
        self.inner.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgd_proto::{NodeKind, TelemetryNode};

    fn frame(timestamp_ms: u32) -> TelemetryFrame {
        TelemetryFrame {
            timestamp_ms,
            nodes: vec![TelemetryNode {
                id: 3,
                kind: NodeKind::Consumer,
                demand: 1.0,
                fulfillment: 1.0,
            }],
        }
    }

    #[test]
    fn latest_frame_wins() {
        let slot = TelemetrySlot::new();
        assert!(!slot.publish(frame(1)));
        assert!(slot.publish(frame(2)));
        let taken = slot.take().expect("frame present");
        assert_eq!(taken.timestamp_ms, 2);
        assert!(slot.take().is_none());
    }
}
