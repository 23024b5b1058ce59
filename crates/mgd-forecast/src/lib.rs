//! ---
//! mgd_section: "03-forecasting"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Demand history buffers and Fourier projection."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
//! Short-horizon demand forecasting for the dispatch loop.
//!
//! The forecaster is a pure function of a node's demand history and the
//! tuning parameters: deterministic, never negative, and independent of
//! wall-clock time.

pub mod fourier;
pub mod history;

pub use fourier::{detect_dominant_period, forecast, Forecast, ForecastParams, PeriodSelection};
pub use history::HistoryBuffer;
