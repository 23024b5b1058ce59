//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Shared primitives and utilities for the dispatch runtime."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_tick_interval() -> Duration {
    Duration::from_millis(42)
}

fn default_solve_budget() -> Duration {
    Duration::from_millis(25)
}

fn default_stale_after() -> Duration {
    Duration::from_millis(5000)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_history_depth() -> usize {
    200
}

fn default_min_samples() -> usize {
    32
}

fn default_fourier_terms() -> usize {
    2
}

fn default_fourier_period() -> usize {
    120
}

fn default_horizon() -> usize {
    10
}

fn default_residual_window() -> usize {
    64
}

fn default_nominal_amps() -> f64 {
    5.0
}

fn default_observer_enabled() -> bool {
    true
}

fn default_observer_listen() -> SocketAddr {
    "0.0.0.0:8080"
        .parse()
        .expect("valid default observer address")
}

fn default_expose_metrics() -> bool {
    true
}

fn default_oracle_deadline() -> Duration {
    Duration::from_millis(300)
}

fn default_snapshot_history() -> usize {
    10
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the MGD runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    /// Supply sources available to the dispatcher, fixed for the run.
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub oracle: Option<OracleConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MGD_CONFIG";

    /// Load configuration from disk, respecting the `MGD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                return Self::from_path(PathBuf::from(env_path));
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                return Self::from_path(candidate.as_ref().to_path_buf());
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.controller.tick_interval.is_zero() {
            return Err(anyhow!("controller tick_interval_ms must be positive"));
        }
        if self.sources.is_empty() {
            return Err(anyhow!("configuration must declare at least one source"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.source_id) {
                return Err(anyhow!("duplicate source_id {}", source.source_id));
            }
        }
        self.forecast.validate()?;
        self.solver.validate()?;
        if let Some(oracle) = &self.oracle {
            oracle.validate()?;
        }
        Ok(())
    }

    /// Look up a source spec by id.
    pub fn source(&self, source_id: u8) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Cadence and lifecycle settings for the tick loop.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Tick cadence. 42 ms gives the nominal 24 Hz loop.
    #[serde(default = "default_tick_interval", rename = "tick_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    /// Hard wall-clock budget for a single solve.
    #[serde(default = "default_solve_budget", rename = "solve_budget_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub solve_budget: Duration,
    /// Nodes unseen for this long are retired from the table.
    #[serde(default = "default_stale_after", rename = "stale_after_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stale_after: Duration,
    /// Grace period granted to background tasks during shutdown.
    #[serde(default = "default_shutdown_grace", rename = "shutdown_grace_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown_grace: Duration,
    /// Per-node demand history ring depth.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            solve_budget: default_solve_budget(),
            stale_after: default_stale_after(),
            shutdown_grace: default_shutdown_grace(),
            history_depth: default_history_depth(),
        }
    }
}

/// Demand-forecast tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Below this many samples the forecaster flat-fills from the latest value.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Number of Fourier terms to fit, clamped to 1..=2.
    #[serde(default = "default_fourier_terms")]
    pub fourier_terms: usize,
    /// Fixed fit period in samples, used unless `detect_period` is set.
    #[serde(default = "default_fourier_period")]
    pub period: usize,
    /// Scan for the dominant period instead of using the fixed one.
    #[serde(default)]
    pub detect_period: bool,
    /// Projection horizon in ticks.
    #[serde(default = "default_horizon")]
    pub horizon: usize,
    /// Residual-variance window in samples.
    #[serde(default = "default_residual_window")]
    pub residual_window: usize,
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(anyhow!("forecast horizon must be at least 1"));
        }
        if !(1..=2).contains(&self.fourier_terms) {
            return Err(anyhow!("forecast fourier_terms must be 1 or 2"));
        }
        if self.period < 4 {
            return Err(anyhow!("forecast period must be at least 4 samples"));
        }
        Ok(())
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            fourier_terms: default_fourier_terms(),
            period: default_fourier_period(),
            detect_period: false,
            horizon: default_horizon(),
            residual_window: default_residual_window(),
        }
    }
}

/// Dispatch-solver tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Restrict each consumer to a single supplying source.
    #[serde(default)]
    pub single_source_per_node: bool,
    /// Penalty per amp of unmet demand. Defaults to 10x the highest
    /// configured cost_per_amp when unset.
    #[serde(default)]
    pub unmet_penalty: Option<f64>,
    /// Reference current used to normalize dispatch supply levels.
    #[serde(default = "default_nominal_amps")]
    pub nominal_amps: f64,
    /// Per-node overrides of the nominal reference current, keyed by node id.
    #[serde(default)]
    #[serde_as(as = "IndexMap<DisplayFromStr, _>")]
    pub nominal_overrides: IndexMap<u8, f64>,
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nominal_amps <= 0.0 {
            return Err(anyhow!("solver nominal_amps must be positive"));
        }
        for (node_id, nominal) in &self.nominal_overrides {
            if *nominal <= 0.0 {
                return Err(anyhow!(
                    "solver nominal override for node {} must be positive",
                    node_id
                ));
            }
        }
        if let Some(penalty) = self.unmet_penalty {
            if penalty <= 0.0 {
                return Err(anyhow!("solver unmet_penalty must be positive"));
            }
        }
        Ok(())
    }

    /// Nominal reference current for a node.
    pub fn nominal_for(&self, node_id: u8) -> f64 {
        self.nominal_overrides
            .get(&node_id)
            .copied()
            .unwrap_or(self.nominal_amps)
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            single_source_per_node: false,
            unmet_penalty: None,
            nominal_amps: default_nominal_amps(),
            nominal_overrides: IndexMap::new(),
        }
    }
}

/// A supply source enumerated at startup, immutable for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: u8,
    /// Maximum deliverable current in amps.
    pub max_capacity: f64,
    /// Cost per amp supplied.
    pub cost_per_amp: f64,
    /// Maximum output change per tick, in amps. None means unconstrained.
    #[serde(default)]
    pub ramp_limit: Option<f64>,
    /// Renewable flag, used for reporting and tie-breaks only.
    #[serde(default)]
    pub green: bool,
}

impl SourceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.max_capacity <= 0.0 {
            return Err(anyhow!(
                "source {} has non-positive max_capacity",
                self.source_id
            ));
        }
        if self.cost_per_amp < 0.0 {
            return Err(anyhow!(
                "source {} has negative cost_per_amp",
                self.source_id
            ));
        }
        if let Some(ramp) = self.ramp_limit {
            if ramp < 0.0 {
                return Err(anyhow!("source {} has negative ramp_limit", self.source_id));
            }
        }
        Ok(())
    }
}

/// Hardware endpoint connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `host:port` of the endpoint's stream listener.
    pub address: String,
}

/// Observer read-interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(default = "default_observer_enabled")]
    pub enabled: bool,
    #[serde(default = "default_observer_listen")]
    pub listen: SocketAddr,
    /// Expose the Prometheus registry at /metrics.
    #[serde(default = "default_expose_metrics")]
    pub expose_metrics: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: default_observer_enabled(),
            listen: default_observer_listen(),
            expose_metrics: default_expose_metrics(),
        }
    }
}

/// Escalation-oracle settings. Absent section disables escalation requests.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// HTTP endpoint of the external reasoning service.
    pub endpoint: String,
    /// Absolute per-request deadline.
    #[serde(default = "default_oracle_deadline", rename = "deadline_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub deadline: Duration,
    /// How many recent snapshots accompany an escalation request.
    #[serde(default = "default_snapshot_history")]
    pub snapshot_history: usize,
}

impl OracleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(anyhow!("oracle endpoint must not be empty"));
        }
        if self.deadline.is_zero() {
            return Err(anyhow!("oracle deadline_ms must be positive"));
        }
        Ok(())
    }
}

/// Logging destinations and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling daily JSON log file. Stdout-only when
    /// unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// File name prefix for the rolling log; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [endpoint]
        address = "127.0.0.1:9600"

        [[sources]]
        source_id = 1
        max_capacity = 5.0
        cost_per_amp = 0.10
        ramp_limit = 0.5
        green = true
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: AppConfig = MINIMAL.parse().expect("config parses");
        assert_eq!(config.controller.tick_interval, Duration::from_millis(42));
        assert_eq!(config.controller.solve_budget, Duration::from_millis(25));
        assert_eq!(config.controller.stale_after, Duration::from_millis(5000));
        assert_eq!(config.controller.history_depth, 200);
        assert_eq!(config.forecast.min_samples, 32);
        assert_eq!(config.forecast.period, 120);
        assert!(config.oracle.is_none());
        assert!((config.solver.nominal_for(3) - 5.0).abs() < f64::EPSILON);
        let source = config.source(1).expect("source 1 present");
        assert!(source.green);
    }

    #[test]
    fn zero_capacity_source_is_fatal() {
        let raw = r#"
            [endpoint]
            address = "127.0.0.1:9600"

            [[sources]]
            source_id = 1
            max_capacity = 0.0
            cost_per_amp = 0.10
        "#;
        let err = raw.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("max_capacity"));
    }

    #[test]
    fn negative_ramp_is_fatal() {
        let raw = r#"
            [endpoint]
            address = "127.0.0.1:9600"

            [[sources]]
            source_id = 1
            max_capacity = 5.0
            cost_per_amp = 0.10
            ramp_limit = -1.0
        "#;
        let err = raw.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("ramp_limit"));
    }

    #[test]
    fn duplicate_source_ids_rejected() {
        let raw = r#"
            [endpoint]
            address = "127.0.0.1:9600"

            [[sources]]
            source_id = 1
            max_capacity = 5.0
            cost_per_amp = 0.10

            [[sources]]
            source_id = 1
            max_capacity = 3.0
            cost_per_amp = 0.20
        "#;
        let err = raw.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("duplicate source_id"));
    }

    #[test]
    fn empty_source_table_rejected() {
        let raw = r#"
            [endpoint]
            address = "127.0.0.1:9600"
        "#;
        assert!(raw.parse::<AppConfig>().is_err());
    }

    #[test]
    fn nominal_overrides_apply_per_node() {
        let raw = r#"
            [endpoint]
            address = "127.0.0.1:9600"

            [solver]
            nominal_amps = 5.0

            [solver.nominal_overrides]
            4 = 2.5

            [[sources]]
            source_id = 1
            max_capacity = 5.0
            cost_per_amp = 0.10
        "#;
        let config: AppConfig = raw.parse().expect("config parses");
        assert!((config.solver.nominal_for(4) - 2.5).abs() < f64::EPSILON);
        assert!((config.solver.nominal_for(5) - 5.0).abs() < f64::EPSILON);
    }
}
