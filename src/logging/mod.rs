use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::LoggingConfig;
use crate::storage::expand_home_path;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn as_colored_str(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
            Self::Verbose => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Drops every line. Used when neither a file nor stdout is configured.
pub struct DiscardSink;

impl LogSink for DiscardSink {
    fn write_line(&self, _line: &str) {}
}

/// Append-only log file. Write errors are dropped, like the stdout sink.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

#[derive(Debug)]
pub enum LoggerSetupError {
    InvalidLevel { value: String },
    ResolvePath { path: String, reason: String },
    OpenFile { path: String, source: io::Error },
}

impl fmt::Display for LoggerSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLevel { value } => write!(
                f,
                "invalid logging.level '{value}'. Allowed values: error, warn, info, debug, verbose"
            ),
            Self::ResolvePath { path, reason } => {
                write!(f, "cannot resolve log file path '{path}': {reason}")
            }
            Self::OpenFile { path, source } => {
                write!(f, "failed to open log file '{path}': {source}")
            }
        }
    }
}

impl std::error::Error for LoggerSetupError {}

#[derive(Debug, PartialEq, Eq)]
enum SinkTarget {
    File(PathBuf),
    Stdout,
    Discard,
}

fn sink_target(config: &LoggingConfig) -> Result<SinkTarget, LoggerSetupError> {
    match (config.file.as_deref(), config.stdout) {
        (Some(raw_path), _) => expand_home_path(raw_path)
            .map(SinkTarget::File)
            .map_err(|error| LoggerSetupError::ResolvePath {
                path: raw_path.to_owned(),
                reason: error.to_string(),
            }),
        (None, true) => Ok(SinkTarget::Stdout),
        (None, false) => Ok(SinkTarget::Discard),
    }
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    /// Builds a logger writing to `logging.file` when set, to stdout only when
    /// `logging.stdout` is enabled, and nowhere otherwise.
    pub fn from_app_config(config: &LoggingConfig) -> Result<Self, LoggerSetupError> {
        let min_level = LogLevel::from_config_value(&config.level).ok_or_else(|| {
            LoggerSetupError::InvalidLevel {
                value: config.level.clone(),
            }
        })?;
        let logger_config = LoggerConfig {
            min_level,
            human_friendly: config.human_friendly,
        };

        let sink: Arc<dyn LogSink> = match sink_target(config)? {
            SinkTarget::File(path) => {
                Arc::new(FileSink::open(&path).map_err(|source| LoggerSetupError::OpenFile {
                    path: path.display().to_string(),
                    source,
                })?)
            }
            SinkTarget::Stdout => Arc::new(StdoutSink),
            SinkTarget::Discard => Arc::new(DiscardSink),
        };
        Ok(Self::with_sink(logger_config, sink))
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.should_log(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            level.as_colored_str()
        } else {
            level.as_str()
        };

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!("{timestamp} [{rendered_level}]{context_part} {message}{payload_part}")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}
