//! Structured logging for strainguard
//!
//! Console output goes to stderr so CLI tables on stdout stay clean. An optional
//! JSON log file receives every event with its session and cycle spans, rotated
//! daily when rotation is enabled.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info_span, Span, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::models::PersonProfile;

/// File name used when `file_path` names a directory-less or unnamed path
pub const DEFAULT_LOG_FILE: &str = "strainguard.log";

/// HTTP and SQLite internals are held at `warn` unless `RUST_LOG` says otherwise
const DEPENDENCY_TARGETS: [&str; 4] = ["reqwest", "hyper", "hyper_util", "rusqlite"];

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,

    /// Console format (pretty, json, compact)
    pub format: LogFormat,

    /// JSON log file; console only when absent
    pub file_path: Option<PathBuf>,

    /// Rotate the log file daily
    pub rotation: bool,

    /// Emit span enter/close events and span lists
    pub include_spans: bool,

    /// Keep HTTP and SQLite crates at `warn` whatever the engine level
    pub quiet_dependencies: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: true,
            include_spans: false,
            quiet_dependencies: true,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![format!("strainguard={}", self.level.as_str())];
        if self.quiet_dependencies {
            directives.extend(DEPENDENCY_TARGETS.iter().map(|t| format!("{}=warn", t)));
        }
        directives.join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Map a `-v` count from the command line onto a level
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    Json,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Span wrapping a person's whole sensor session; cycle spans nest inside it
pub fn session_span(profile: &PersonProfile) -> Span {
    info_span!(
        "sensor_session",
        person_id = %profile.person_id,
        group_id = %profile.group_id
    )
}

fn console_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_line_number(true)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(config.include_spans)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .boxed(),
    }
}

/// Split a log path into its directory and file name
fn log_location(path: &Path) -> (PathBuf, String) {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (directory, file_name)
}

fn file_layer<S>(path: &Path, config: &LogConfig) -> anyhow::Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let (directory, file_name) = log_location(path);
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_current_span(true)
        .with_span_list(config.include_spans);

    let layer = if config.rotation {
        layer
            .with_writer(tracing_appender::rolling::daily(&directory, &file_name))
            .boxed()
    } else {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(directory.join(&file_name))
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        layer.with_writer(file).boxed()
    };
    Ok(layer)
}

/// Install the global subscriber; `RUST_LOG` overrides the configured filter
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let file = config
        .file_path
        .as_deref()
        .map(|path| file_layer(path, config))
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(config))
        .with(file)
        .try_init()?;

    tracing::debug!(
        level = config.level.as_str(),
        format = ?config.format,
        file = ?config.file_path,
        "logging initialized"
    );
    Ok(())
}
