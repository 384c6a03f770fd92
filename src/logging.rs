//! Tracing setup for applications built on this driver.
//!
//! The library itself only emits `tracing` events. Binaries call [`init`] (or
//! [`init_from_settings`]) once to install a subscriber. `RUST_LOG` overrides
//! the configured level when set.
//!
//! # Example
//! ```no_run
//! use daq_driver_aiousb::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> daq_driver_aiousb::Result<()> {
//! logging::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact))?;
//! tracing::info!(device = 0, "Acquisition ready");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

use crate::error::{AiousbError, Result};
use crate::settings::AcquisitionSettings;

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    #[default]
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names (the acquisition worker is named)
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Create tracing config from acquisition settings
    pub fn from_settings(settings: &AcquisitionSettings) -> Result<Self> {
        Ok(Self::new(parse_log_level(&settings.log_level)?))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the `log_level` of acquisition settings.
pub fn init_from_settings(settings: &AcquisitionSettings) -> Result<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install a global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`,
/// which keeps it safe to call from tests.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(format_layer(&config).with_filter(env_filter))
        .try_init()
        .or_else(already_initialized)
}

/// Formatting layer for `config.format`. ANSI colors apply to Pretty only.
fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
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

    match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    }
}

fn already_initialized(e: TryInitError) -> Result<()> {
    // Tests and embedding applications may have installed a subscriber first
    if tracing::dispatcher::has_been_set() {
        Ok(())
    } else {
        Err(AiousbError::InvalidConfig {
            message: format!("Failed to initialize tracing: {e}"),
        })
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(AiousbError::InvalidConfig {
            message: format!(
                "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));

        // Case insensitive
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));

        // Invalid
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_tracing_config_from_settings() {
        let settings = AcquisitionSettings {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let config = TracingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::DEBUG);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn test_format_layer_for_every_format() {
        for format in [OutputFormat::Pretty, OutputFormat::Compact, OutputFormat::Json] {
            let config = TracingConfig::new(Level::TRACE)
                .with_format(format)
                .with_span_events(true);
            let subscriber = tracing_subscriber::registry().with(format_layer(&config));
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!(?format, "format layer installed");
            });
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init(TracingConfig::new(Level::INFO).with_format(OutputFormat::Compact)).is_ok());
        assert!(init(TracingConfig::new(Level::DEBUG)).is_ok());
    }
}
