//! Structured logging setup using the tracing crate.
//!
//! Applications embedding the pool call [`LoggingBuilder::init`] once; the
//! pool itself only emits through `tracing` macros and the injected tracer.

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{PoolError, PoolResult};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Pretty console output with colors
    Pretty,
    /// Compact single-line output
    #[default]
    Compact,
    /// JSON structured output
    Json,
}

/// Builder for the global subscriber.
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    format: LogFormat,
    filter: String,
    ansi: bool,
    with_spans: bool,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: "info".to_string(),
            ansi: true,
            with_spans: false,
        }
    }
}

impl LoggingBuilder {
    /// Create a new logging builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the fallback filter directive (used when `RUST_LOG` is unset).
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Set ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Log span open/close events.
    pub fn with_spans(mut self, enabled: bool) -> Self {
        self.with_spans = enabled;
        self
    }

    fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(self) -> PoolResult<()> {
        let env_filter = self.build_filter();
        let registry = tracing_subscriber::registry().with(env_filter);

        let result = match self.format {
            LogFormat::Pretty => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_ansi(self.ansi)
                        .with_span_events(self.span_events()),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(self.ansi)
                        .with_span_events(self.span_events()),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(self.with_spans)
                        .with_span_events(self.span_events()),
                )
                .try_init(),
        };

        result.map_err(|e| PoolError::Configuration(format!("logging: {}", e)))
    }
}

/// Install a global subscriber with `format` and a fallback `filter`.
pub fn init_logging(format: LogFormat, filter: &str) -> PoolResult<()> {
    LoggingBuilder::new()
        .with_format(format)
        .with_filter(filter)
        .init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = LoggingBuilder::new();
        assert_eq!(builder.format, LogFormat::Compact);
        assert_eq!(builder.filter, "info");
        assert_eq!(builder.span_events(), FmtSpan::NONE);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(LogFormat::Compact, "warn");
        assert!(init_logging(LogFormat::Json, "warn").is_err());
    }

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
