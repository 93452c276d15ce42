//! Tracing setup for the daemon.
//!
//! One global subscriber, configured from the serve flags: text or JSON
//! output, and a log level applied to this crate while dependencies stay
//! at `info`. A `RUST_LOG` value with explicit directives overrides both.

use clap::{Args, ValueEnum};
use std::fmt;
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt as subscriber_fmt};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Default, Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Default, Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct Logger {
    /// Log format
    #[arg(long, env = "RBDVOL_LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,

    /// Log level
    #[arg(long, env = "RBDVOL_LOG_LEVEL", value_enum, default_value_t)]
    pub log_level: LogLevel,
}

impl Logger {
    fn filter(&self) -> EnvFilter {
        // A bare level in RUST_LOG ("debug") scopes to this crate, like
        // the flag; anything with directives is taken as-is.
        match std::env::var("RUST_LOG") {
            Ok(spec) if spec.contains('=') || spec.contains(',') => EnvFilter::new(spec),
            Ok(level) => EnvFilter::new(format!("info,rbdvol={level}")),
            Err(_) => EnvFilter::new(format!("info,rbdvol={}", self.log_level)),
        }
    }

    pub fn init(&self) -> Result<(), LoggingError> {
        let base = tracing_subscriber::registry().with(self.filter());
        match self.log_format {
            LogFormat::Json => base
                .with(subscriber_fmt::layer().json().with_current_span(false))
                .try_init(),
            LogFormat::Text => base
                .with(subscriber_fmt::layer().with_target(false))
                .try_init(),
        }
        .map_err(LoggingError::Init)
    }
}
