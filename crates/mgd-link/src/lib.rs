//! ---
//! mgd_section: "05-networking-external-interfaces"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Persistent duplex stream to the hardware endpoint."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Endpoint link: one persistent TCP stream carrying telemetry inbound and
//! dispatch outbound.
//!
//! The reader resynchronizes on malformed input by discarding bytes up to
//! the next magic; disconnection triggers an exponential-backoff reconnect.
//! Telemetry lands in a latest-only slot and outbound dispatch rides a
//! latest-value cell, so the tick loop never blocks on the stream.

pub mod endpoint;
pub mod slot;

pub use endpoint::{EndpointLink, LinkCounters, LinkHandle};
pub use slot::TelemetrySlot;
