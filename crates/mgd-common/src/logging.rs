//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Shared primitives and utilities for the dispatch runtime."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "MGD_LOG";

/// Default filter tuned for a 24 Hz control loop: controller crates speak at
/// info, per-tick detail stays behind debug, and the HTTP plumbing under the
/// observer API and oracle client is quieted to warnings.
const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,reqwest=warn,tower=warn";

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Flush guards for the non-blocking log writers.
///
/// Hold this for the lifetime of the process; dropping it early loses
/// buffered log lines, including the final shutdown messages.
#[must_use]
pub struct TracingGuard {
    _stdout: WorkerGuard,
    _file: Option<WorkerGuard>,
}

/// Resolve the log filter: `MGD_LOG` wins, then the standard `RUST_LOG`,
/// finally the dispatch-tuned default. Invalid directives are skipped with a
/// note on stderr rather than silently discarded.
fn resolve_filter() -> EnvFilter {
    for key in [LOG_ENV, "RUST_LOG"] {
        match std::env::var(key) {
            Ok(directive) if !directive.trim().is_empty() => {
                match EnvFilter::try_new(&directive) {
                    Ok(filter) => return filter,
                    Err(err) => eprintln!("ignoring invalid {key} directive ({err})"),
                }
            }
            _ => {}
        }
    }
    EnvFilter::new(DEFAULT_DIRECTIVE)
}

/// Initialize the tracing subscriber for a daemon process.
///
/// Stdout always gets a layer in the configured format. A rolling daily JSON
/// file is added only when the configuration names a log directory, so
/// bench and simulation runs stay filesystem-free by default.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<TracingGuard> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(stdout_writer)
            .boxed(),
    };

    let mut file_guard = None;
    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("unable to create log directory {}", directory.display()))?;
            let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
            let appender = tracing_appender::rolling::daily(directory, format!("{prefix}.log"));
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            // The file sink is always structured JSON for post-mortem tooling,
            // whatever the stdout format.
            Some(fmt::layer().json().with_writer(file_writer).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(resolve_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        format = ?config.format,
        file_sink = config.directory.is_some(),
        "tracing initialised"
    );
    Ok(TracingGuard {
        _stdout: stdout_guard,
        _file: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_is_a_valid_filter() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVE).is_ok());
    }

    #[test]
    fn log_format_round_trips_kebab_case() {
        let json = serde_json::to_string(&LogFormat::StructuredJson).unwrap();
        assert_eq!(json, "\"structured-json\"");
        let parsed: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(parsed, LogFormat::Pretty);
    }
}
