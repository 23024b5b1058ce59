//! ---
//! mgd_section: "06-oracle-escalation"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Escalation requests to the external reasoning service."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Single-flight external request channel for low-confidence ticks.
//!
//! At most one request is outstanding; further escalations coalesce into a
//! counter. Responses land in a swap cell that the tick loop polls without
//! blocking, and the absolute per-request deadline means a late reply is
//! simply dropped with its task.

pub mod client;

pub use client::{
    HttpOracleBackend, OracleBackend, OracleClient, OracleError, OracleProposal, OracleRequest,
};
