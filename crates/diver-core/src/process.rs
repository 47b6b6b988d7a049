//! Target process access
//!
//! [`WinProcess`] is the Windows implementation of [`RemoteProcess`]. The handle is opened with
//! only the rights injection needs. Other platforms get stubs that return `NotImplemented`.

use crate::traits::RemoteProcess;
use diver_common::{Architecture, Error, Result};

#[cfg(target_os = "windows")]
pub use windows_impl::WinProcess;

/// Open `pid` for injection
#[cfg(target_os = "windows")]
pub fn open_process(pid: u32) -> Result<Box<dyn RemoteProcess>> {
    Ok(Box::new(WinProcess::open(pid)?))
}

#[cfg(not(target_os = "windows"))]
pub fn open_process(pid: u32) -> Result<Box<dyn RemoteProcess>> {
    Err(Error::NotImplemented(format!(
        "opening process {} requires Windows",
        pid
    )))
}

/// Find a running process by executable name, returning its PID
#[cfg(target_os = "windows")]
pub fn find_process_by_name(name: &str) -> Result<Option<u32>> {
    windows_impl::find_process_by_name(name)
}

#[cfg(not(target_os = "windows"))]
pub fn find_process_by_name(name: &str) -> Result<Option<u32>> {
    Err(Error::NotImplemented(format!(
        "process lookup for '{}' requires Windows",
        name
    )))
}

/// Target architecture from the WOW64 state of the target and of this process.
///
/// A WOW64 target is 32-bit. Otherwise the target is native; a WOW64 controller runs on a 64-bit
/// OS, anything else shares the OS architecture.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) fn target_architecture(target_wow64: bool, host_wow64: bool) -> Architecture {
    if target_wow64 {
        Architecture::X86
    } else if host_wow64 {
        Architecture::X64
    } else {
        Architecture::host()
    }
}

/// Map a Win32 failure to [`Error::Os`], unwrapping `HRESULT_FROM_WIN32`
#[cfg(target_os = "windows")]
pub(crate) fn os_error(operation: &'static str, error: windows::core::Error) -> Error {
    let hresult = error.code().0 as u32;
    let code = if hresult & 0xFFFF_0000 == 0x8007_0000 {
        hresult & 0xFFFF
    } else {
        hresult
    };
    Error::Os { operation, code }
}

#[cfg(target_os = "windows")]
pub(crate) fn wide_to_string(raw: &[u16]) -> String {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..end])
}

#[cfg(target_os = "windows")]
mod windows_impl {
    use super::{os_error, target_architecture, wide_to_string};
    use crate::traits::{RemoteMemory, RemoteProcess};
    use diver_common::{Architecture, Error, Module, Result};
    use std::ffi::c_void;
    use tracing::{debug, info, warn};
    use windows::Win32::Foundation::{CloseHandle, BOOL, ERROR_BAD_LENGTH, HANDLE};
    use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
        MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
        TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::Memory::{
        VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateRemoteThread, GetCurrentProcess, IsWow64Process, OpenProcess, PROCESS_CREATE_THREAD,
        PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
    };

    /// Toolhelp module snapshots fail transiently while the loader is busy
    const SNAPSHOT_ATTEMPTS: u32 = 5;

    /// Handle to a target process
    pub struct WinProcess {
        pid: u32,
        handle: HANDLE,
        architecture: Architecture,
    }

    // Process handles are usable from any thread
    unsafe impl Send for WinProcess {}
    unsafe impl Sync for WinProcess {}

    impl WinProcess {
        pub fn open(pid: u32) -> Result<Self> {
            let rights = PROCESS_CREATE_THREAD
                | PROCESS_QUERY_INFORMATION
                | PROCESS_VM_OPERATION
                | PROCESS_VM_READ
                | PROCESS_VM_WRITE;
            let handle =
                unsafe { OpenProcess(rights, false, pid) }.map_err(|e| os_error("OpenProcess", e))?;

            let mut wow64 = BOOL(0);
            if let Err(e) = unsafe { IsWow64Process(handle, &mut wow64) } {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(os_error("IsWow64Process", e));
            }
            let mut host_wow64 = BOOL(0);
            if let Err(e) = unsafe { IsWow64Process(GetCurrentProcess(), &mut host_wow64) } {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(os_error("IsWow64Process", e));
            }
            let architecture = target_architecture(wow64.as_bool(), host_wow64.as_bool());

            info!(target: "diver_core::process", pid, architecture = ?architecture, "Opened target process");
            Ok(Self {
                pid,
                handle,
                architecture,
            })
        }

        pub fn handle(&self) -> HANDLE {
            self.handle
        }
    }

    impl Drop for WinProcess {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }

    impl RemoteMemory for WinProcess {
        fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let mut buffer = vec![0u8; size];
            let mut read = 0usize;
            unsafe {
                ReadProcessMemory(
                    self.handle,
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
            if read != size {
                return Err(Error::MemoryAccess {
                    address,
                    message: format!("short read: {} of {} bytes", read, size),
                });
            }
            Ok(buffer)
        }

        fn write(&self, address: u64, data: &[u8]) -> Result<()> {
            let mut written = 0usize;
            unsafe {
                WriteProcessMemory(
                    self.handle,
                    address as usize as *const c_void,
                    data.as_ptr() as *const c_void,
                    data.len(),
                    Some(&mut written as *mut usize),
                )
            }
            .map_err(|e| Error::MemoryAccess {
                address,
                message: e.message().to_string(),
            })?;
            if written != data.len() {
                return Err(Error::MemoryAccess {
                    address,
                    message: format!("short write: {} of {} bytes", written, data.len()),
                });
            }
            Ok(())
        }
    }

    impl RemoteProcess for WinProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn architecture(&self) -> Architecture {
            self.architecture
        }

        fn modules(&self) -> Result<Vec<Module>> {
            let flags = TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32;
            let mut attempt = 0;
            let snapshot = loop {
                attempt += 1;
                match unsafe { CreateToolhelp32Snapshot(flags, self.pid) } {
                    Ok(snapshot) => break snapshot,
                    Err(e) if e.code() == ERROR_BAD_LENGTH.to_hresult() && attempt < SNAPSHOT_ATTEMPTS => {
                        debug!(target: "diver_core::process", attempt, "Module snapshot busy, retrying");
                    }
                    Err(e) => return Err(os_error("CreateToolhelp32Snapshot", e)),
                }
            };

            let mut modules = Vec::new();
            let mut entry = MODULEENTRY32W {
                dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
                ..Default::default()
            };
            unsafe {
                if Module32FirstW(snapshot, &mut entry).is_ok() {
                    loop {
                        modules.push(Module {
                            name: wide_to_string(&entry.szModule),
                            path: wide_to_string(&entry.szExePath),
                            base: entry.modBaseAddr as usize as u64,
                            size: entry.modBaseSize as u64,
                        });
                        if Module32NextW(snapshot, &mut entry).is_err() {
                            break;
                        }
                    }
                }
                let _ = CloseHandle(snapshot);
            }
            debug!(target: "diver_core::process", pid = self.pid, count = modules.len(), "Enumerated modules");
            Ok(modules)
        }

        fn allocate(&self, size: usize, executable: bool) -> Result<u64> {
            let protection = if executable {
                PAGE_EXECUTE_READWRITE
            } else {
                PAGE_READWRITE
            };
            let address =
                unsafe { VirtualAllocEx(self.handle, None, size, MEM_COMMIT | MEM_RESERVE, protection) };
            if address.is_null() {
                return Err(os_error("VirtualAllocEx", windows::core::Error::from_win32()));
            }
            Ok(address as usize as u64)
        }

        fn free(&self, address: u64) -> Result<()> {
            unsafe { VirtualFreeEx(self.handle, address as usize as *mut c_void, 0, MEM_RELEASE) }
                .map_err(|e| os_error("VirtualFreeEx", e))
        }

        fn spawn_thread(&self, entry: u64, parameter: u64) -> Result<u32> {
            let mut thread_id = 0u32;
            let thread = unsafe {
                let start = std::mem::transmute::<
                    usize,
                    unsafe extern "system" fn(*mut c_void) -> u32,
                >(entry as usize);
                CreateRemoteThread(
                    self.handle,
                    None,
                    0,
                    Some(start),
                    Some(parameter as usize as *const c_void),
                    0,
                    Some(&mut thread_id as *mut u32),
                )
            }
            .map_err(|e| {
                warn!(target: "diver_core::process", pid = self.pid, error = %e, "CreateRemoteThread failed");
                Error::ThreadCreation(format!("process {}: {}", self.pid, e.message()))
            })?;
            unsafe {
                let _ = CloseHandle(thread);
            }
            Ok(thread_id)
        }
    }

    pub fn find_process_by_name(name: &str) -> Result<Option<u32>> {
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
                .map_err(|e| os_error("CreateToolhelp32Snapshot", e))?;

            let mut entry = PROCESSENTRY32W {
                dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
                ..Default::default()
            };

            let mut found = None;
            if Process32FirstW(snapshot, &mut entry).is_ok() {
                loop {
                    if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(name) {
                        found = Some(entry.th32ProcessID);
                        break;
                    }
                    if Process32NextW(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }

            let _ = CloseHandle(snapshot);
            Ok(found)
        }
    }
}
