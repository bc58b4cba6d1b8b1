//! Tracing setup for the pipeline and the CLI.
//!
//! Builds a `tracing-subscriber` registry with one fmt layer in the chosen
//! format and an `EnvFilter` (`RUST_LOG` wins over the configured level).
//! `init` is idempotent: when a global subscriber is already installed it
//! returns `Ok(())`, which keeps tests and embedding applications happy.
//!
//! # Example
//! ```no_run
//! use frame_acq::logging::{self, LogFormat, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggingConfig::new("debug").with_format(LogFormat::Json);
//! logging::init(&config)?;
//! tracing::info!(frames = 12, "Acquisition finished");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{AcqError, AcqResult};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Single-line format without colors
    #[default]
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Logging configuration (the `[logging]` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events (scheduler ticks are spans)
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Config with the given filter directive.
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Reject filters that do not parse.
    pub fn validate(&self) -> AcqResult<()> {
        parse_log_level(&self.level).map(|_| ())
    }
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> AcqResult<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        LogFormat::Pretty => layer.pretty().with_filter(env_filter).boxed(),
        LogFormat::Compact => layer
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => layer.json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Another component or test harness installed a subscriber first.
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(AcqError::Configuration(format!(
                    "Failed to initialize tracing: {}",
                    e
                )))
            }
        })
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> AcqResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(AcqError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
