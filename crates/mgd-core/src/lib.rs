//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Primary dispatch loop and lifecycle management."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! The closed-loop dispatch pipeline.
//!
//! One cooperative tick loop owns the node table, per-tick solver state, and
//! snapshot assembly. Background tasks (endpoint link reader, oracle client)
//! communicate with it exclusively through single-slot swap cells, keeping
//! end-to-end tick latency predictable.

pub mod controller;
pub mod nodes;
pub mod rt;
pub mod snapshot;

pub use controller::{ControllerHandle, DispatchController};
pub use nodes::{NodeState, NodeTable};
pub use rt::RateLimiter;
pub use snapshot::{
    DispatchDetail, Economics, Snapshot, SnapshotBroadcaster, SnapshotNode, SourceUsage,
};
