//! Bootstrap stub generation using iced-x86
//!
//! The stub runs on a fresh thread in the target and chains the hosting calls that load the
//! agent into the default application domain:
//!
//! 1. `CLRCreateInstance(CLSID_CLRMetaHost, IID_ICLRMetaHost, &meta_host)`
//! 2. `meta_host->GetRuntime(version, IID_ICLRRuntimeInfo, &runtime_info)`
//! 3. `runtime_info->GetInterface(CLSID_CLRRuntimeHost, IID_ICLRRuntimeHost, &host)`
//! 4. `host->ExecuteInDefaultAppDomain(path, type, method, argument, &return_value)`
//!
//! All operands live in a data block written beforehand; the stub only embeds their absolute
//! addresses. A failed HRESULT skips the remaining calls and becomes the thread exit code.

use diver_common::{Architecture, Error, Result};
use iced_x86::code_asm::*;
use tracing::{debug, info};

/// `ICLRMetaHost::GetRuntime`
pub const META_HOST_GET_RUNTIME_SLOT: i32 = 3;
/// `ICLRRuntimeInfo::GetInterface`
pub const RUNTIME_INFO_GET_INTERFACE_SLOT: i32 = 9;
/// `ICLRRuntimeHost::ExecuteInDefaultAppDomain`
pub const RUNTIME_HOST_EXECUTE_SLOT: i32 = 11;

/// x64 frame: shadow space plus two stack arguments, keeps rsp 16-byte aligned after `push rbx`
const X64_FRAME: i32 = 0x30;

/// Result of assembly operation
#[derive(Debug, Clone)]
pub struct AssemblyResult {
    pub bytes: Vec<u8>,
    pub address: u64,
    pub instruction_count: usize,
    pub architecture: Architecture,
}

/// Absolute target-side addresses the stub refers to
#[derive(Debug, Clone, Default)]
pub struct BootstrapAddresses {
    /// `CLRCreateInstance` in the target
    pub create_instance: u64,
    pub clsid_meta_host: u64,
    pub iid_meta_host: u64,
    pub iid_runtime_info: u64,
    pub clsid_runtime_host: u64,
    pub iid_runtime_host: u64,
    /// UTF-16 strings
    pub runtime_version: u64,
    pub agent_path: u64,
    pub type_name: u64,
    pub method_name: u64,
    pub argument: u64,
    /// Pointer-sized out slots
    pub meta_host_slot: u64,
    pub runtime_info_slot: u64,
    pub runtime_host_slot: u64,
    /// DWORD written by the agent entry point
    pub return_slot: u64,
}

/// x86/x64 Assembler using iced-x86
pub struct Assembler {
    architecture: Architecture,
}

fn asm_err(e: IcedError) -> Error {
    Error::Encoding(format!("Assembly error: {}", e))
}

impl Assembler {
    pub fn new(architecture: Architecture) -> Self {
        debug!(target: "diver_core::assembler", architecture = ?architecture, "Creating assembler");
        Self { architecture }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Assemble using builder pattern for complex sequences
    pub fn assemble_with_builder<F>(&self, address: u64, builder: F) -> Result<AssemblyResult>
    where
        F: FnOnce(&mut CodeAssembler) -> std::result::Result<(), IcedError>,
    {
        let mut asm = CodeAssembler::new(self.architecture.bitness()).map_err(asm_err)?;
        builder(&mut asm).map_err(asm_err)?;
        let bytes = asm.assemble(address).map_err(asm_err)?;
        Ok(AssemblyResult {
            instruction_count: asm.instructions().len(),
            bytes,
            address,
            architecture: self.architecture,
        })
    }

    /// Thread-entry stub for the target's architecture, assembled to run at `address`
    pub fn bootstrap_stub(
        &self,
        address: u64,
        addresses: &BootstrapAddresses,
    ) -> Result<AssemblyResult> {
        if self.architecture == Architecture::X86 {
            check_32bit(addresses)?;
        }
        let result = match self.architecture {
            Architecture::X64 => self.assemble_with_builder(address, |asm| emit_x64(asm, addresses)),
            Architecture::X86 => self.assemble_with_builder(address, |asm| emit_x86(asm, addresses)),
        }?;
        info!(
            target: "diver_core::assembler",
            architecture = ?self.architecture,
            size = result.bytes.len(),
            instructions = result.instruction_count,
            "Assembled bootstrap stub"
        );
        Ok(result)
    }
}

fn check_32bit(addresses: &BootstrapAddresses) -> Result<()> {
    let all = [
        addresses.create_instance,
        addresses.clsid_meta_host,
        addresses.iid_meta_host,
        addresses.iid_runtime_info,
        addresses.clsid_runtime_host,
        addresses.iid_runtime_host,
        addresses.runtime_version,
        addresses.agent_path,
        addresses.type_name,
        addresses.method_name,
        addresses.argument,
        addresses.meta_host_slot,
        addresses.runtime_info_slot,
        addresses.runtime_host_slot,
        addresses.return_slot,
    ];
    match all.iter().find(|a| **a > u32::MAX as u64) {
        Some(a) => Err(Error::ArchitectureMismatch(format!(
            "address {:#x} does not fit a 32-bit target",
            a
        ))),
        None => Ok(()),
    }
}

fn emit_x64(asm: &mut CodeAssembler, a: &BootstrapAddresses) -> std::result::Result<(), IcedError> {
    let mut done = asm.create_label();

    // rbx holds the interface being called; it is callee-saved
    asm.push(rbx)?;
    asm.sub(rsp, X64_FRAME)?;

    asm.mov(rcx, a.clsid_meta_host)?;
    asm.mov(rdx, a.iid_meta_host)?;
    asm.mov(r8, a.meta_host_slot)?;
    asm.mov(rax, a.create_instance)?;
    asm.call(rax)?;
    asm.test(eax, eax)?;
    asm.js(done)?;

    asm.mov(rax, a.meta_host_slot)?;
    asm.mov(rbx, qword_ptr(rax))?;
    asm.mov(rcx, rbx)?;
    asm.mov(rdx, a.runtime_version)?;
    asm.mov(r8, a.iid_runtime_info)?;
    asm.mov(r9, a.runtime_info_slot)?;
    asm.mov(rax, qword_ptr(rbx))?;
    asm.call(qword_ptr(rax + META_HOST_GET_RUNTIME_SLOT * 8))?;
    asm.test(eax, eax)?;
    asm.js(done)?;

    asm.mov(rax, a.runtime_info_slot)?;
    asm.mov(rbx, qword_ptr(rax))?;
    asm.mov(rcx, rbx)?;
    asm.mov(rdx, a.clsid_runtime_host)?;
    asm.mov(r8, a.iid_runtime_host)?;
    asm.mov(r9, a.runtime_host_slot)?;
    asm.mov(rax, qword_ptr(rbx))?;
    asm.call(qword_ptr(rax + RUNTIME_INFO_GET_INTERFACE_SLOT * 8))?;
    asm.test(eax, eax)?;
    asm.js(done)?;

    // Arguments 5 and 6 go above the shadow space
    asm.mov(rax, a.runtime_host_slot)?;
    asm.mov(rbx, qword_ptr(rax))?;
    asm.mov(rax, a.argument)?;
    asm.mov(qword_ptr(rsp + 0x20), rax)?;
    asm.mov(rax, a.return_slot)?;
    asm.mov(qword_ptr(rsp + 0x28), rax)?;
    asm.mov(rcx, rbx)?;
    asm.mov(rdx, a.agent_path)?;
    asm.mov(r8, a.type_name)?;
    asm.mov(r9, a.method_name)?;
    asm.mov(rax, qword_ptr(rbx))?;
    asm.call(qword_ptr(rax + RUNTIME_HOST_EXECUTE_SLOT * 8))?;

    asm.set_label(&mut done)?;
    asm.add(rsp, X64_FRAME)?;
    asm.pop(rbx)?;
    asm.ret()?;
    Ok(())
}

fn emit_x86(asm: &mut CodeAssembler, a: &BootstrapAddresses) -> std::result::Result<(), IcedError> {
    let mut done = asm.create_label();
    // Every call is stdcall: arguments pushed right to left, callee pops them
    let imm = |v: u64| v as u32 as i32;

    asm.push(ebx)?;

    asm.push(imm(a.meta_host_slot))?;
    asm.push(imm(a.iid_meta_host))?;
    asm.push(imm(a.clsid_meta_host))?;
    asm.mov(eax, imm(a.create_instance))?;
    asm.call(eax)?;
    asm.test(eax, eax)?;
    asm.js(done)?;

    asm.mov(eax, imm(a.meta_host_slot))?;
    asm.mov(ebx, dword_ptr(eax))?;
    asm.push(imm(a.runtime_info_slot))?;
    asm.push(imm(a.iid_runtime_info))?;
    asm.push(imm(a.runtime_version))?;
    asm.push(ebx)?;
    asm.mov(eax, dword_ptr(ebx))?;
    asm.call(dword_ptr(eax + META_HOST_GET_RUNTIME_SLOT * 4))?;
    asm.test(eax, eax)?;
    asm.js(done)?;

    asm.mov(eax, imm(a.runtime_info_slot))?;
    asm.mov(ebx, dword_ptr(eax))?;
    asm.push(imm(a.runtime_host_slot))?;
    asm.push(imm(a.iid_runtime_host))?;
    asm.push(imm(a.clsid_runtime_host))?;
    asm.push(ebx)?;
    asm.mov(eax, dword_ptr(ebx))?;
    asm.call(dword_ptr(eax + RUNTIME_INFO_GET_INTERFACE_SLOT * 4))?;
    asm.test(eax, eax)?;
    asm.js(done)?;

    asm.mov(eax, imm(a.runtime_host_slot))?;
    asm.mov(ebx, dword_ptr(eax))?;
    asm.push(imm(a.return_slot))?;
    asm.push(imm(a.argument))?;
    asm.push(imm(a.method_name))?;
    asm.push(imm(a.type_name))?;
    asm.push(imm(a.agent_path))?;
    asm.push(ebx)?;
    asm.mov(eax, dword_ptr(ebx))?;
    asm.call(dword_ptr(eax + RUNTIME_HOST_EXECUTE_SLOT * 4))?;

    asm.set_label(&mut done)?;
    asm.pop(ebx)?;
    // Thread start routine is stdcall with one parameter
    asm.ret_1(4)?;
    Ok(())
}
