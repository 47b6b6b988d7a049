//! Paused process copies for heap snapshots
//!
//! A [`ForkedProcess`] is a PSS snapshot of the target with a cloned address space. Heap walkers
//! read the clone while the target keeps running. Dropping it releases the clone handle and the
//! snapshot, in that order.
//!
//! [`ForkedSnapshotSource`] ties the two together: every capture forks the target and hands the
//! copy to a [`HeapWalker`]. The walker's snapshot owns the copy, so disposing the snapshot
//! releases the OS resources behind it.

use crate::traits::{HeapSnapshot, RemoteMemory, SnapshotSource};
use diver_common::Result;
use tracing::debug;

#[cfg(not(target_os = "windows"))]
use diver_common::Error;

#[cfg(target_os = "windows")]
pub use windows_impl::ForkedProcess;

/// Capture a forked copy of `pid`
#[cfg(target_os = "windows")]
pub fn fork_process(pid: u32) -> Result<Box<dyn RemoteMemory>> {
    Ok(Box::new(ForkedProcess::capture(pid)?))
}

#[cfg(not(target_os = "windows"))]
pub fn fork_process(pid: u32) -> Result<Box<dyn RemoteMemory>> {
    Err(Error::NotImplemented(format!(
        "forking process {} requires Windows",
        pid
    )))
}

/// Produces paused copies of one target
pub trait Forker: Send + Sync {
    fn fork(&self) -> Result<Box<dyn RemoteMemory>>;
}

/// Forks a target by PID
#[derive(Debug, Clone, Copy)]
pub struct PidForker {
    pid: u32,
}

impl PidForker {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Forker for PidForker {
    fn fork(&self) -> Result<Box<dyn RemoteMemory>> {
        fork_process(self.pid)
    }
}

/// Runtime binding that walks a managed heap inside a paused copy
pub trait HeapWalker: Send + Sync {
    /// Build a snapshot that keeps `memory` alive until it is disposed
    fn walk(&self, memory: Box<dyn RemoteMemory>) -> Result<Box<dyn HeapSnapshot>>;
}

/// [`SnapshotSource`] that forks the target for every capture
pub struct ForkedSnapshotSource<F, W> {
    forker: F,
    walker: W,
}

impl<F: Forker, W: HeapWalker> ForkedSnapshotSource<F, W> {
    pub fn new(forker: F, walker: W) -> Self {
        Self { forker, walker }
    }
}

impl<F: Forker, W: HeapWalker> SnapshotSource for ForkedSnapshotSource<F, W> {
    fn capture(&self) -> Result<Box<dyn HeapSnapshot>> {
        let memory = self.forker.fork()?;
        let snapshot = self.walker.walk(memory)?;
        debug!(target: "diver_core::fork", types = snapshot.types().len(), "Walked forked heap");
        Ok(snapshot)
    }
}

#[cfg(target_os = "windows")]
mod windows_impl {
    use crate::process::os_error;
    use crate::traits::RemoteMemory;
    use diver_common::{Error, Result};
    use std::ffi::c_void;
    use tracing::{debug, info, warn};
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WIN32_ERROR};
    use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows::Win32::System::Diagnostics::ProcessSnapshotting::{
        PssCaptureSnapshot, PssFreeSnapshot, PssQuerySnapshot, HPSS, PSS_CAPTURE_THREADS,
        PSS_CAPTURE_THREAD_CONTEXT, PSS_CAPTURE_VA_CLONE, PSS_QUERY_VA_CLONE_INFORMATION,
        PSS_VA_CLONE_INFORMATION,
    };
    use windows::Win32::System::Threading::{
        GetCurrentProcess, GetProcessId, OpenProcess, PROCESS_CREATE_PROCESS,
        PROCESS_DUP_HANDLE, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    };

    #[cfg(target_arch = "x86_64")]
    const CONTEXT_ALL: u32 = 0x0010_001F;
    #[cfg(not(target_arch = "x86_64"))]
    const CONTEXT_ALL: u32 = 0x0001_003F;

    fn check(operation: &'static str, status: u32) -> Result<()> {
        if status == 0 {
            Ok(())
        } else {
            Err(os_error(
                operation,
                windows::core::Error::from(WIN32_ERROR(status).to_hresult()),
            ))
        }
    }

    /// PSS snapshot of a target with a readable clone of its address space
    pub struct ForkedProcess {
        source_pid: u32,
        source: HANDLE,
        snapshot: HPSS,
        clone: HANDLE,
    }

    // Kernel handles are usable from any thread
    unsafe impl Send for ForkedProcess {}
    unsafe impl Sync for ForkedProcess {}

    impl ForkedProcess {
        pub fn capture(pid: u32) -> Result<Self> {
            let rights = PROCESS_CREATE_PROCESS
                | PROCESS_DUP_HANDLE
                | PROCESS_QUERY_INFORMATION
                | PROCESS_VM_READ;
            let source =
                unsafe { OpenProcess(rights, false, pid) }.map_err(|e| os_error("OpenProcess", e))?;

            let mut snapshot = HPSS::default();
            let flags = PSS_CAPTURE_VA_CLONE | PSS_CAPTURE_THREADS | PSS_CAPTURE_THREAD_CONTEXT;
            let captured = check("PssCaptureSnapshot", unsafe {
                PssCaptureSnapshot(source, flags, CONTEXT_ALL, &mut snapshot)
            });
            if let Err(e) = captured {
                unsafe {
                    let _ = CloseHandle(source);
                }
                return Err(e);
            }

            let mut info = PSS_VA_CLONE_INFORMATION::default();
            let queried = check("PssQuerySnapshot", unsafe {
                PssQuerySnapshot(
                    snapshot,
                    PSS_QUERY_VA_CLONE_INFORMATION,
                    &mut info as *mut _ as *mut c_void,
                    std::mem::size_of::<PSS_VA_CLONE_INFORMATION>() as u32,
                )
            });
            if let Err(e) = queried {
                unsafe {
                    let _ = PssFreeSnapshot(GetCurrentProcess(), snapshot);
                    let _ = CloseHandle(source);
                }
                return Err(e);
            }

            let forked = Self {
                source_pid: pid,
                source,
                snapshot,
                clone: info.VaCloneHandle,
            };
            info!(
                target: "diver_core::fork",
                pid,
                clone_pid = forked.clone_pid(),
                "Captured process snapshot"
            );
            Ok(forked)
        }

        pub fn source_pid(&self) -> u32 {
            self.source_pid
        }

        /// PID of the clone process backing the snapshot
        pub fn clone_pid(&self) -> u32 {
            unsafe { GetProcessId(self.clone) }
        }

        pub fn clone_handle(&self) -> HANDLE {
            self.clone
        }
    }

    impl RemoteMemory for ForkedProcess {
        fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let mut buffer = vec![0u8; size];
            let mut read = 0usize;
            unsafe {
                ReadProcessMemory(
                    self.clone,
                    address as usize as *const c_void,
                    buffer.as_mut_ptr() as *mut c_void,
                    size,
                    Some(&mut read as *mut usize),
                )
            }
            .map_err(|e| Error::MemoryAccess {
                address,
                message: e.message().to_string(),
            })?;
            buffer.truncate(read);
            if read != size {
                return Err(Error::MemoryAccess {
                    address,
                    message: format!("short read: {} of {} bytes", read, size),
                });
            }
            Ok(buffer)
        }

        fn write(&self, address: u64, _data: &[u8]) -> Result<()> {
            Err(Error::MemoryAccess {
                address,
                message: "process snapshots are read-only".to_string(),
            })
        }
    }

    impl Drop for ForkedProcess {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.clone);
                let status = PssFreeSnapshot(GetCurrentProcess(), self.snapshot);
                if status != 0 {
                    warn!(target: "diver_core::fork", pid = self.source_pid, status, "PssFreeSnapshot failed");
                }
                let _ = CloseHandle(self.source);
            }
            debug!(target: "diver_core::fork", pid = self.source_pid, "Released process snapshot");
        }
    }
}
