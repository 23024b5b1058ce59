//! ---
//! mgd_section: "02-wire-protocol"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Binary frame layouts and codec for the endpoint link."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Fixed-layout binary protocol spoken on the hardware endpoint link.
//!
//! Two frame types, each prefixed by a 32-bit little-endian magic:
//! telemetry (endpoint to controller) and dispatch (controller to endpoint).
//! All multi-byte fields are little-endian; floats are IEEE-754 single
//! precision.

pub mod codec;
pub mod frames;

pub use codec::{
    decode_dispatch, decode_telemetry, dispatch_frame_len, encode_dispatch, encode_telemetry,
    scan_for_magic, telemetry_frame_len, CodecError, DISPATCH_HEADER_LEN, DISPATCH_MAGIC,
    MAX_NODES, TELEMETRY_HEADER_LEN, TELEMETRY_MAGIC,
};
pub use frames::{DispatchCommand, DispatchFrame, NodeKind, TelemetryFrame, TelemetryNode};
