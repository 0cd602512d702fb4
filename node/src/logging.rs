//! # Structured Logging
//!
//! Sets up the `tracing` subscriber: pretty or JSON output, filtered by
//! `RUST_LOG`. Everything goes to stderr, so `zkredit-node status` can print
//! its JSON to stdout.
//!
//! Engine events carry their ids as fields (`agent_id`, `token_id`,
//! `line_id`, `proof_id`), so the JSON format can be filtered per entity
//! downstream. Orchestrator commands open a span per call; the JSON layer
//! includes it.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "zkredit_node=info,zkredit_protocol=info,tower_http=info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for local development.
    Pretty,
    /// JSON lines for log aggregation.
    Json,
}

impl LogFormat {
    /// Accepts "json" or "pretty", case-insensitive. Anything else is `Pretty`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber. Call once, early in `main()`; a second
/// call panics.
///
/// # Arguments
///
/// * `default_level` - directives used when `RUST_LOG` is unset, normally
///   [`DEFAULT_FILTER`].
/// * `format` - pretty or JSON lines.
///
/// # Environment
///
/// `RUST_LOG` overrides `default_level`. Authorization decisions and token
/// handling log under `zkredit_protocol::agent`, so this shows every spend
/// check and void without the HTTP noise:
///
/// ```text
/// RUST_LOG=zkredit_protocol::agent=debug,zkredit_protocol=info,tower_http=warn
/// ```
pub fn init_logging(default_level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_current_span(true)
                        .with_target(true),
                )
                .init();
        }
    }

    tracing::debug!(?format, "logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_is_lenient() {
        assert_eq!(LogFormat::from_str_lossy("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_str_lossy("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str_lossy("yaml"), LogFormat::Pretty);
    }

    #[test]
    fn default_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER).expect("valid directives");
        assert!(filter.to_string().contains("zkredit_protocol=info"));
    }
}
