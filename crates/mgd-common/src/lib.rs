//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Shared primitives and utilities for the dispatch runtime."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Core shared primitives for the MGD controller workspace.
//! This crate exposes configuration loading, logging, and loop-timing
//! utilities consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;

pub use config::{
    AppConfig, ControllerConfig, EndpointConfig, ForecastConfig, LoggingConfig, ObserverConfig,
    OracleConfig, SolverConfig, SourceSpec,
};
pub use logging::{init_tracing, LogFormat, TracingGuard};
pub use metrics::{JitterHistogram, LoopTimingReporter};
