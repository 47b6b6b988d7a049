//! Diver Core Library
//!
//! Controller-side injection and export resolution, plus the agent-side runtime: heap
//! snapshots with staleness checks, pinned objects, GC coordination and request handling.
//! Platform access sits behind the traits in [`traits`] so the runtime logic is testable
//! without a live target.

pub mod assembler;
pub mod diver;
pub mod fork;
pub mod frozen;
pub mod gc;
pub mod injector;
pub mod members;
pub mod pe;
pub mod process;
pub mod snapshot;
pub mod traits;

pub use assembler::{Assembler, AssemblyResult, BootstrapAddresses};
pub use diver::Diver;
pub use diver_common::{Error, Result};
pub use frozen::{FrozenObjects, ObjectPinner, PinRoutine, PinnedObject, RoutinePinner};
pub use fork::{fork_process, ForkedSnapshotSource, Forker, HeapWalker, PidForker};
pub use gc::{CollectorControl, DispatchMode, GcCoordinator, GcNotification, GcPause};
pub use injector::{inject, wait_for_agent, AgentArgument, InjectionReport, InjectionRequest};
pub use pe::{ExportResolver, ModuleExportTable};
pub use process::{find_process_by_name, open_process};
pub use snapshot::SnapshotRuntime;
pub use traits::*;
