//! Common types used across Diver components
//!
//! - `module` - Loaded modules, exports and target architecture
//! - `heap` - Remote addresses, heap types and scan candidates
//! - `object` - Values crossing the process boundary and primitive encoding
//! - `protocol` - Request/response records exchanged with the agent

pub mod heap;
pub mod module;
pub mod object;
pub mod protocol;

pub use heap::*;
pub use module::*;
pub use object::*;
pub use protocol::*;
