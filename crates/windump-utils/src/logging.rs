//! # Logging Utilities
//!
//! Logging infrastructure for windump using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty (development) and JSON (machine) output
//! - Environment variable configuration, overridable from the command line
//! - An optional file sink written off-thread by `tracing-appender`
//!
//! Only the install/uninstall side of crash capture logs through here. The
//! exception handler itself writes to the capture log next to the dump and
//! never touches the subscriber.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use windump_utils::LogSettings;
//!
//! // RUST_LOG, WINDUMP_LOG_FORMAT and WINDUMP_LOG_FILE
//! let _logging = LogSettings::from_env().init().expect("Failed to initialize logging");
//!
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=windump_core=debug`)
//! - `WINDUMP_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `WINDUMP_LOG_FILE`: Optional path to a log file (console only if not set)
//!
//! ## Examples
//!
//! ```rust,no_run
//! use windump_utils::{LogFormat, LogLevel, LogSettings};
//!
//! // Explicit level, as from a `--log-level` flag
//! let _logging = LogSettings::from_env()
//!     .with_level(LogLevel::Debug)
//!     .with_format(LogFormat::Json)
//!     .init()
//!     .expect("Failed to initialize logging");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const FORMAT_ENV: &str = "WINDUMP_LOG_FORMAT";
/// Environment variable naming the optional log file.
pub const FILE_ENV: &str = "WINDUMP_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    #[default]
    Pretty,
    /// JSON format, one object per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s}. Use 'pretty' or 'json'"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl LogLevel
{
    /// Name accepted by [`FromStr`], for passing the level on to a child.
    #[must_use]
    pub const fn as_str(self) -> &'static str
    {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            ))),
        }
    }
}

/// Where log output goes and how much of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings
{
    /// `RUST_LOG`-style directive
    pub filter: String,
    /// Console and file format
    pub format: LogFormat,
    /// Optional file sink
    pub file: Option<PathBuf>,
}

impl Default for LogSettings
{
    fn default() -> Self
    {
        Self {
            filter: Level::INFO.to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogSettings
{
    /// Read `RUST_LOG`, `WINDUMP_LOG_FORMAT` and `WINDUMP_LOG_FILE`.
    ///
    /// Unparseable values fall back to the defaults (`info`, pretty, no file).
    #[must_use]
    pub fn from_env() -> Self
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`LogSettings::from_env`] with an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        let defaults = Self::default();

        let filter = lookup("RUST_LOG")
            .filter(|directive| EnvFilter::try_new(directive).is_ok())
            .unwrap_or(defaults.filter);

        let format = lookup(FORMAT_ENV)
            .and_then(|s| LogFormat::from_str(&s).ok())
            .unwrap_or(defaults.format);

        let file = lookup(FILE_ENV).filter(|path| !path.is_empty()).map(PathBuf::from);

        Self { filter, format, file }
    }

    /// Replace the filter with a single level (a `--log-level` flag).
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.filter = Level::from(level).to_string();
        self
    }

    /// Replace the format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    /// Add or replace the file sink.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self
    {
        self.file = Some(file.into());
        self
    }

    /// Install the global subscriber. Console output goes to stderr.
    ///
    /// Keep the returned guard alive: dropping it flushes and stops the file
    /// writer.
    ///
    /// ## Errors
    ///
    /// Returns an error if:
    /// - The filter directive is invalid
    /// - A global subscriber is already installed
    /// - The log file's directory cannot be created
    pub fn init(&self) -> Result<LoggingGuard, LoggingError>
    {
        let filter = EnvFilter::try_new(&self.filter).map_err(|err| LoggingError::InvalidLevel(err.to_string()))?;

        let mut layers: Vec<BoxedLayer> = vec![console_layer(self.format)];
        let mut worker = None;

        if let Some(path) = &self.file {
            let (directory, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(&directory)?;

            // The path is used as given: no date suffix, no rotation
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            layers.push(file_layer(self.format, non_blocking));
            worker = Some(guard);
        }

        Registry::default()
            .with(layers.with_filter(filter))
            .try_init()
            .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;

        Ok(LoggingGuard { _worker: worker })
    }
}

/// Keeps the file writer alive; see [`LogSettings::init`].
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _worker: Option<WorkerGuard>,
}

/// Initialize logging from the environment.
///
/// Shorthand for `LogSettings::from_env().init()`.
///
/// ## Errors
///
/// See [`LogSettings::init`].
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    LogSettings::from_env().init()
}

/// Initialize logging with explicit level and format; `WINDUMP_LOG_FILE` is still honoured.
///
/// ## Errors
///
/// See [`LogSettings::init`].
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    LogSettings::from_env().with_level(level).with_format(format).init()
}

fn console_layer(format: LogFormat) -> BoxedLayer
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, writer: tracing_appender::non_blocking::NonBlocking) -> BoxedLayer
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false) // No ANSI in files
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    }
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf), LoggingError>
{
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.display().to_string()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(file_name)))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level or filter directive
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Log file path has no file name
    #[error("Invalid log file path: {0}")]
    InvalidFile(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
    {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("dev").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(matches!(LogFormat::from_str("invalid"), Err(LoggingError::InvalidFormat(_))));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warn").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("debug").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(matches!(LogLevel::from_str("invalid"), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_log_level_name_parses_back()
    {
        for level in [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug, LogLevel::Trace] {
            assert_eq!(LogLevel::from_str(level.as_str()).unwrap(), level);
        }
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_settings_defaults_without_environment()
    {
        let settings = LogSettings::from_lookup(lookup_from(&[]));
        assert_eq!(settings, LogSettings::default());
        assert_eq!(settings.filter, "INFO");
    }

    #[test]
    fn test_settings_read_environment()
    {
        let settings = LogSettings::from_lookup(lookup_from(&[
            ("RUST_LOG", "windump_core=debug"),
            (FORMAT_ENV, "json"),
            (FILE_ENV, "/var/log/windump.log"),
        ]));
        assert_eq!(settings.filter, "windump_core=debug");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.file, Some(PathBuf::from("/var/log/windump.log")));
    }

    #[test]
    fn test_settings_ignore_bad_values()
    {
        let settings = LogSettings::from_lookup(lookup_from(&[
            ("RUST_LOG", "[[not a directive"),
            (FORMAT_ENV, "xml"),
            (FILE_ENV, ""),
        ]));
        assert_eq!(settings, LogSettings::default());
    }

    #[test]
    fn test_cli_level_overrides_environment()
    {
        let settings = LogSettings::from_lookup(lookup_from(&[("RUST_LOG", "trace")])).with_level(LogLevel::Warn);
        assert_eq!(settings.filter, "WARN");
    }

    #[test]
    fn test_split_log_path()
    {
        let (directory, file) = split_log_path(Path::new("logs/windump.log")).unwrap();
        assert_eq!(directory, PathBuf::from("logs"));
        assert_eq!(file, PathBuf::from("windump.log"));

        let (directory, _) = split_log_path(Path::new("windump.log")).unwrap();
        assert_eq!(directory, PathBuf::from("."));

        assert!(matches!(split_log_path(Path::new("/")), Err(LoggingError::InvalidFile(_))));
    }
}
