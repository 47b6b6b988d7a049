//! Diver configuration
//!
//! Every field has a default, so an empty file (or no file) is a valid configuration.

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiverConfig {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub injector: InjectorConfig,
}

/// Heap snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Attempts for a predicate-filtered heap scan before giving up
    #[serde(default = "default_scan_retries")]
    pub scan_retries: u32,
}

/// Collector coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Full-collection approach notification threshold (1-99)
    #[serde(default = "default_gc_threshold")]
    pub approach_threshold: u32,
    /// Full-collection complete notification threshold (1-99)
    #[serde(default = "default_gc_threshold")]
    pub complete_threshold: u32,
    /// How long the listener waits for a notification before checking for cancellation
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timer period used when collector notifications are unavailable
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Allocation budget requested while full collections are suppressed
    #[serde(default = "default_no_gc_budget_bytes")]
    pub no_gc_budget_bytes: u64,
}

/// Injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorConfig {
    /// Hosted runtime version requested from the meta host
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,
    /// How long to wait for the agent to answer a liveness probe
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// Delay between liveness probes
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
}

fn default_scan_retries() -> u32 {
    10
}

fn default_gc_threshold() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_cleanup_interval_ms() -> u64 {
    1000
}

fn default_no_gc_budget_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_runtime_version() -> String {
    "v4.0.30319".to_string()
}

fn default_liveness_timeout_ms() -> u64 {
    30000
}

fn default_liveness_poll_ms() -> u64 {
    250
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            scan_retries: default_scan_retries(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            approach_threshold: default_gc_threshold(),
            complete_threshold: default_gc_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            no_gc_budget_bytes: default_no_gc_budget_bytes(),
        }
    }
}

impl GcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            runtime_version: default_runtime_version(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            liveness_poll_ms: default_liveness_poll_ms(),
        }
    }
}

impl InjectorConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

impl DiverConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot.scan_retries == 0 {
            return Err(Error::Config("snapshot.scan_retries must be at least 1".into()));
        }
        if self.gc.poll_interval_ms == 0 || self.gc.cleanup_interval_ms == 0 {
            return Err(Error::Config("gc intervals must be non-zero".into()));
        }
        for threshold in [self.gc.approach_threshold, self.gc.complete_threshold] {
            if !(1..=99).contains(&threshold) {
                return Err(Error::Config(format!(
                    "gc notification threshold {} outside 1..=99",
                    threshold
                )));
            }
        }
        if self.injector.liveness_poll_ms == 0 {
            return Err(Error::Config("injector.liveness_poll_ms must be non-zero".into()));
        }
        Ok(())
    }
}
