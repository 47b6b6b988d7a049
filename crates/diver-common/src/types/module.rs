//! Module-related types

use serde::{Deserialize, Serialize};

/// Module loaded in a target process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub base: u64,
    pub size: u64,
}

impl Module {
    /// Case-insensitive match against the module name, its full path or the path's file name
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.path.eq_ignore_ascii_case(name)
            || module_name_from_path(&self.path).eq_ignore_ascii_case(name)
    }
}

/// File name component of a module path, accepting both separators
pub fn module_name_from_path(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Export entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub rva: u32,
    pub ordinal: u16,
    /// "DLL.Symbol" when the export forwards to another module
    pub forwarder: Option<String>,
}

/// Instruction set of a target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    pub fn bitness(&self) -> u32 {
        match self {
            Architecture::X86 => 32,
            Architecture::X64 => 64,
        }
    }

    pub fn pointer_size(&self) -> usize {
        match self {
            Architecture::X86 => 4,
            Architecture::X64 => 8,
        }
    }

    /// Architecture of the running binary
    pub fn host() -> Self {
        #[cfg(target_pointer_width = "64")]
        return Self::X64;
        #[cfg(target_pointer_width = "32")]
        return Self::X86;
    }
}
