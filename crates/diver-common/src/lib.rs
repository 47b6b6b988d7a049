//! Diver Common Types
//!
//! Shared error type, logging, configuration and the remote object protocol used by the
//! controller and the injected agent.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{DiverConfig, GcConfig, InjectorConfig, SnapshotConfig};
pub use error::{Error, Result};
pub use logging::{init_agent_logging, init_host_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
