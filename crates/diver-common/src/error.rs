//! Error types for Diver

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: u64, message: String },

    #[error("{operation} failed (os error {code:#x})")]
    Os { operation: &'static str, code: u32 },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Invalid image at {base:#x}: {reason}")]
    InvalidImage { base: u64, reason: String },

    #[error("Architecture mismatch: {0}")]
    ArchitectureMismatch(String),

    #[error("Instruction encoding failed: {0}")]
    Encoding(String),

    #[error("Remote thread creation failed: {0}")]
    ThreadCreation(String),

    #[error("Type not found: {0}")]
    TypeNotFound(String),

    #[error("Ambiguous type name '{name}', candidates: {candidates:?}")]
    AmbiguousType {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Stale pointer at {address:#x}: expected '{expected}', found '{actual}'")]
    StalePointer {
        address: u64,
        expected: String,
        actual: String,
    },

    #[error("Ambiguous object of type '{type_name}' with hash code {hash_code}: {matches} matches")]
    AmbiguousObject {
        type_name: String,
        hash_code: i32,
        matches: usize,
    },

    #[error("Object of type '{type_name}' with hash code {hash_code} is no longer on the heap")]
    ObjectLost { type_name: String, hash_code: i32 },

    #[error("Heap scan failed after {attempts} attempts")]
    ScanRetriesExhausted { attempts: u32 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Invalid primitive '{type_name}': {message}")]
    InvalidPrimitive { type_name: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a caller may retry the same request unchanged.
    ///
    /// Identity errors need caller-supplied disambiguation and are never retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::StalePointer { .. }
                | Error::AmbiguousObject { .. }
                | Error::AmbiguousType { .. }
                | Error::ObjectLost { .. }
                | Error::ArchitectureMismatch(_)
                | Error::Encoding(_)
                | Error::ThreadCreation(_)
        )
    }

    /// Short machine-readable kind, used when errors cross the process boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MemoryAccess { .. } => "memory_access",
            Error::Os { .. } => "os",
            Error::ModuleNotFound(_) => "module_not_found",
            Error::ExportNotFound(_) => "export_not_found",
            Error::InvalidImage { .. } => "invalid_image",
            Error::ArchitectureMismatch(_) => "architecture_mismatch",
            Error::Encoding(_) => "encoding",
            Error::ThreadCreation(_) => "thread_creation",
            Error::TypeNotFound(_) => "type_not_found",
            Error::AmbiguousType { .. } => "ambiguous_type",
            Error::StalePointer { .. } => "stale_pointer",
            Error::AmbiguousObject { .. } => "ambiguous_object",
            Error::ObjectLost { .. } => "object_lost",
            Error::ScanRetriesExhausted { .. } => "scan_retries_exhausted",
            Error::Snapshot(_) => "snapshot",
            Error::InvalidPrimitive { .. } => "invalid_primitive",
            Error::Protocol(_) => "protocol",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Timeout(_) => "timeout",
            Error::NotImplemented(_) => "not_implemented",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
