//! Logging setup for the herd binary and embedders.
//!
//! # Environment Variables
//!
//! - `HERD_LOG` - Log filter (overrides `RUST_LOG`)
//! - `HERD_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker output is logged under the `herd::worker` target, so
//! `HERD_LOG=info,herd::worker=warn` silences worker stdout.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per line, for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{s}'. Valid options: pretty, compact, json"
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Custom filter string; overrides `level` when set.
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Derive the level from `-v`/`-q` counts.
    pub fn with_verbosity(mut self, verbose: u8, quiet: u8) -> Self {
        self.level = match i16::from(verbose) - i16::from(quiet) {
            i16::MIN..=-2 => Level::ERROR,
            -1 => Level::WARN,
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set by the caller wins over `HERD_LOG`/`RUST_LOG`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.filter.is_none() {
            self.filter = lookup("HERD_LOG").or_else(|| lookup("RUST_LOG"));
        }

        if let Some(format) = lookup("HERD_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.format = format;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{filter}', using default");
                fallback()
            }),
            None => fallback(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns an error if a subscriber is already installed.
pub fn try_init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = config.build_filter();
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }

    Ok(())
}

/// Install the global tracing subscriber, ignoring repeated calls.
pub fn init(config: &LogConfig) {
    let _ = try_init(config);
}
