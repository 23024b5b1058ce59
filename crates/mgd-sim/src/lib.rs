//! ---
//! mgd_section: "11-simulation-test-harness"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Synthetic telemetry and endpoint emulation."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Simulation support: a seeded sinusoidal telemetry generator matching the
//! waveforms of the reference hardware, and a TCP endpoint emulator that
//! speaks the binary wire protocol for integration tests and demo runs.

pub mod endpoint;
pub mod generator;

pub use endpoint::{SimEndpoint, SimEndpointHandle};
pub use generator::TelemetryGenerator;
