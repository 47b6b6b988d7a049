//! Logging setup shared by the loader and the agent
//!
//! The loader logs to stderr. The agent runs inside someone else's process, so it logs to a
//! per-PID file instead of touching the target's console.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

/// Logging configuration, the `[logging]` table of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log to stderr
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Log to `file_path`
    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_path")]
    pub file_path: String,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file/line info
    #[serde(default)]
    pub file_info: bool,

    #[serde(default = "default_true")]
    pub show_target: bool,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    /// Level or `EnvFilter` directive string; `RUST_LOG` wins when set
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "diver.log".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: default_log_path(),
            timestamps: true,
            file_info: false,
            show_target: true,
            ansi_colors: true,
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// File-only configuration used inside the target process
    pub fn agent(path: impl Into<String>) -> Self {
        Self {
            console_enabled: false,
            file_enabled: true,
            file_path: path.into(),
            ansi_colors: false,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    /// Parse level string to tracing Level
    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn file_writer() -> Box<dyn Write + Send> {
    if let Ok(guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_ref() {
            if let Ok(f) = file.try_clone() {
                return Box::new(f);
            }
        }
    }
    Box::new(std::io::sink())
}

/// Initialize logging with the given configuration
///
/// Only the first call installs a subscriber; later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_active = config.file_enabled
        && !config.file_path.is_empty()
        && OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)
            .ok()
            .and_then(|file| LOG_FILE.lock().ok().map(|mut guard| *guard = Some(file)))
            .is_some();

    let console_layer = config.console_enabled.then(|| {
        fmt::layer()
            .with_ansi(config.ansi_colors)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(std::io::stderr)
    });

    let file_layer = file_active.then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(file_writer)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Initialize logging for the agent inside the target process
///
/// Writes to `{cwd}/diver-agent-{pid}.log` so several injected targets do not collide.
pub fn init_agent_logging() {
    let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    path.push(format!("diver-agent-{}.log", std::process::id()));
    init_logging(&LogConfig::agent(path.to_string_lossy()));
}

/// Initialize logging for the loader with default settings
pub fn init_host_logging() {
    init_logging(&LogConfig::default());
}
