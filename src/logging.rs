//! Logging setup for the procpool binary and worker processes.
//!
//! The library only emits `tracing` events; installing a subscriber is up to the
//! program that hosts the pool. Everything here writes to stderr, never stdout, since
//! a worker's stdout is its status channel.
//!
//! # Environment Variables
//!
//! - `PROCPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PROCPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Workers inherit the controller's environment, so the same variables configure both.
//!
//! # Example
//!
//! ```no_run
//! use procpool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_controller().with_env_overrides());
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
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
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
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
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to a daily-rotated log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs
    pub show_target: bool,
    /// Show thread IDs
    pub show_thread_ids: bool,
    /// Colorize stderr output when it is a terminal
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Preset for the process that owns the pool.
    pub fn for_controller() -> Self {
        Self::default()
    }

    /// Preset for worker processes: warnings and up, one line per event.
    pub fn for_worker() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log file path.
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Enable span timing events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Enable or disable colored stderr output.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Set a custom filter string.
    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set (from the command line) is kept; otherwise `PROCPOOL_LOG`,
    /// then `RUST_LOG`, then `PROCPOOL_LOG_LEVEL` apply.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PROCPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("PROCPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PROCPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("PROCPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer for `writer`, in the configured format.
    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer
                .compact()
                .with_thread_ids(self.show_thread_ids)
                .boxed(),
            LogFormat::Pretty => layer.with_thread_ids(self.show_thread_ids).boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Map verbosity flags to a level: quiet wins, then -v (debug) and -vv (trace).
pub fn level_for_verbosity(verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

fn file_appender(path: &Path) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("procpool.log");
    RollingFileAppender::new(Rotation::DAILY, parent, file_name)
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr, and also to `config.file_path` when set. Subsequent calls are
/// silently ignored.
pub fn init(config: LogConfig) {
    let ansi = config.ansi && std::io::stderr().is_terminal();
    let mut layers = vec![config.fmt_layer(std::io::stderr, ansi)];
    if let Some(path) = &config.file_path {
        layers.push(config.fmt_layer(file_appender(path), false));
    }

    let result = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}
