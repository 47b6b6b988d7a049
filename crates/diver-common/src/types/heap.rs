//! Heap-level identity types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current heap location of an object. Not durable across a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteAddress(pub u64);

impl RemoteAddress {
    pub const NULL: RemoteAddress = RemoteAddress(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for RemoteAddress {
    fn from(value: u64) -> Self {
        RemoteAddress(value)
    }
}

/// A type known to a heap snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapType {
    /// Full name, e.g. `App.Model.User`
    pub name: String,
    /// Owning module name
    pub module: String,
    /// Type-descriptor pointer stored in every instance header
    pub descriptor: u64,
}

impl HeapType {
    /// Name without namespace or declaring type
    pub fn short_name(&self) -> &str {
        short_type_name(&self.name)
    }
}

/// Segment after the last `.` or `+` of a type name
pub fn short_type_name(name: &str) -> &str {
    name.rsplit(['.', '+']).next().unwrap_or(name)
}

/// Tentative identity produced by a heap scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateObject {
    pub address: RemoteAddress,
    pub type_full_name: String,
    /// Identity hash, used to re-locate the object after it moves
    pub hash_code: i32,
}
