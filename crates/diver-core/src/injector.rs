//! Hosted-runtime injection
//!
//! Loads the agent assembly into a running target by starting a remote thread on a generated
//! bootstrap stub. Injection is fire-and-forget: [`inject`] returns once the thread is running,
//! and [`wait_for_agent`] confirms the agent came up.

use crate::assembler::{Assembler, BootstrapAddresses};
use crate::pe::ExportResolver;
use crate::traits::RemoteProcess;
use diver_common::{Error, InjectorConfig, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Module exporting the hosting bootstrap
pub const BOOTSTRAP_MODULE: &str = "mscoree.dll";
pub const BOOTSTRAP_EXPORT: &str = "CLRCreateInstance";
/// Separator of the fields of an agent argument
pub const ARGUMENT_SEPARATOR: char = '*';

/// Room reserved for the stub; both variants are well under this
const STUB_CAPACITY: usize = 0x1000;

/// COM class or interface identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl ComGuid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// In-memory layout expected by COM
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

pub const CLSID_CLR_META_HOST: ComGuid = ComGuid::new(
    0x9280188d,
    0x0e8e,
    0x4867,
    [0xb3, 0x0c, 0x7f, 0xa8, 0x38, 0x84, 0xe8, 0xde],
);
pub const IID_ICLR_META_HOST: ComGuid = ComGuid::new(
    0xd332db9e,
    0xb9b3,
    0x4125,
    [0x82, 0x07, 0xa1, 0x48, 0x84, 0xf5, 0x32, 0x16],
);
pub const IID_ICLR_RUNTIME_INFO: ComGuid = ComGuid::new(
    0xbd39d1d2,
    0xba2f,
    0x486a,
    [0x89, 0xb0, 0xb4, 0xb0, 0xcb, 0x46, 0x68, 0x91],
);
pub const CLSID_CLR_RUNTIME_HOST: ComGuid = ComGuid::new(
    0x90f1a06e,
    0x7712,
    0x4762,
    [0x86, 0xb5, 0x7a, 0x5e, 0xba, 0x6b, 0xdb, 0x02],
);
pub const IID_ICLR_RUNTIME_HOST: ComGuid = ComGuid::new(
    0x90f1a06c,
    0x7712,
    0x4762,
    [0x86, 0xb5, 0x7a, 0x5e, 0xba, 0x6b, 0xdb, 0x02],
);

/// Argument string handed to the agent entry point: fields joined by `*`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentArgument {
    fields: Vec<String>,
}

impl AgentArgument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; fields may not contain the separator
    pub fn field(mut self, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.contains(ARGUMENT_SEPARATOR) {
            return Err(Error::Protocol(format!(
                "agent argument field '{}' contains '{}'",
                value, ARGUMENT_SEPARATOR
            )));
        }
        self.fields.push(value);
        Ok(self)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn encode(&self) -> String {
        self.fields.join(ARGUMENT_SEPARATOR.to_string().as_str())
    }

    pub fn decode(encoded: &str) -> Self {
        if encoded.is_empty() {
            return Self::default();
        }
        Self {
            fields: encoded
                .split(ARGUMENT_SEPARATOR)
                .map(str::to_string)
                .collect(),
        }
    }
}

/// What to load and where to enter it
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    /// Full path of the agent assembly, as seen by the target
    pub agent_path: String,
    /// Full name of the entry type
    pub type_name: String,
    /// Static `int Method(string)` entry point
    pub method_name: String,
    pub argument: String,
    pub runtime_version: String,
}

impl InjectionRequest {
    pub fn new(
        agent_path: impl Into<String>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            agent_path: agent_path.into(),
            type_name: type_name.into(),
            method_name: method_name.into(),
            argument: String::new(),
            runtime_version: InjectorConfig::default().runtime_version,
        }
    }

    pub fn with_argument(mut self, argument: &AgentArgument) -> Self {
        self.argument = argument.encode();
        self
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }
}

/// Where the injection landed in the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionReport {
    pub pid: u32,
    pub thread_id: u32,
    pub bootstrap_address: u64,
    pub stub_address: u64,
    pub data_address: u64,
}

/// Offsets of every operand inside the data block
#[derive(Debug, Clone, Default)]
struct DataLayout {
    clsid_meta_host: u64,
    iid_meta_host: u64,
    iid_runtime_info: u64,
    clsid_runtime_host: u64,
    iid_runtime_host: u64,
    runtime_version: u64,
    agent_path: u64,
    type_name: u64,
    method_name: u64,
    argument: u64,
    meta_host_slot: u64,
    runtime_info_slot: u64,
    runtime_host_slot: u64,
    return_slot: u64,
}

impl DataLayout {
    /// Absolute addresses once the block is placed at `base`
    fn at(&self, base: u64, create_instance: u64) -> BootstrapAddresses {
        BootstrapAddresses {
            create_instance,
            clsid_meta_host: base + self.clsid_meta_host,
            iid_meta_host: base + self.iid_meta_host,
            iid_runtime_info: base + self.iid_runtime_info,
            clsid_runtime_host: base + self.clsid_runtime_host,
            iid_runtime_host: base + self.iid_runtime_host,
            runtime_version: base + self.runtime_version,
            agent_path: base + self.agent_path,
            type_name: base + self.type_name,
            method_name: base + self.method_name,
            argument: base + self.argument,
            meta_host_slot: base + self.meta_host_slot,
            runtime_info_slot: base + self.runtime_info_slot,
            runtime_host_slot: base + self.runtime_host_slot,
            return_slot: base + self.return_slot,
        }
    }
}

#[derive(Debug, Default)]
struct DataBlock {
    bytes: Vec<u8>,
}

impl DataBlock {
    fn align(&mut self, alignment: usize) {
        while self.bytes.len() % alignment != 0 {
            self.bytes.push(0);
        }
    }

    fn push_guid(&mut self, guid: &ComGuid) -> u64 {
        self.align(8);
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(&guid.to_bytes());
        offset
    }

    /// NUL-terminated UTF-16
    fn push_wide(&mut self, text: &str) -> u64 {
        self.align(2);
        let offset = self.bytes.len() as u64;
        for unit in text.encode_utf16().chain(std::iter::once(0)) {
            self.bytes.extend_from_slice(&unit.to_le_bytes());
        }
        offset
    }

    /// Zeroed pointer-sized slot, 8 bytes wide for either architecture
    fn push_slot(&mut self) -> u64 {
        self.align(8);
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(&[0u8; 8]);
        offset
    }

    fn for_request(request: &InjectionRequest) -> (Self, DataLayout) {
        let mut block = Self::default();
        let layout = DataLayout {
            clsid_meta_host: block.push_guid(&CLSID_CLR_META_HOST),
            iid_meta_host: block.push_guid(&IID_ICLR_META_HOST),
            iid_runtime_info: block.push_guid(&IID_ICLR_RUNTIME_INFO),
            clsid_runtime_host: block.push_guid(&CLSID_CLR_RUNTIME_HOST),
            iid_runtime_host: block.push_guid(&IID_ICLR_RUNTIME_HOST),
            meta_host_slot: block.push_slot(),
            runtime_info_slot: block.push_slot(),
            runtime_host_slot: block.push_slot(),
            return_slot: block.push_slot(),
            runtime_version: block.push_wide(&request.runtime_version),
            agent_path: block.push_wide(&request.agent_path),
            type_name: block.push_wide(&request.type_name),
            method_name: block.push_wide(&request.method_name),
            argument: block.push_wide(&request.argument),
        };
        (block, layout)
    }
}

/// Load the agent described by `request` into `process`
pub fn inject<P: RemoteProcess + ?Sized>(
    process: &P,
    request: &InjectionRequest,
) -> Result<InjectionReport> {
    let pid = process.pid();
    let architecture = process.architecture();
    info!(
        target: "diver_core::injector",
        pid,
        architecture = ?architecture,
        agent = %request.agent_path,
        entry = format!("{}::{}", request.type_name, request.method_name),
        "Injecting agent"
    );

    let module = process.find_module(BOOTSTRAP_MODULE)?.ok_or_else(|| {
        Error::ArchitectureMismatch(format!(
            "{} not found in process {} for its {}-bit view",
            BOOTSTRAP_MODULE,
            pid,
            architecture.bitness()
        ))
    })?;
    let bootstrap_address = ExportResolver::new().resolve(process, module.base, BOOTSTRAP_EXPORT)?;

    let mut allocations = Vec::with_capacity(2);
    let started = start_bootstrap(process, request, bootstrap_address, &mut allocations);
    let (data_address, stub_address, thread_id) = match started {
        Ok(placed) => placed,
        Err(e) => {
            // No thread owns the memory yet
            release(process, &allocations);
            return Err(e);
        }
    };
    info!(
        target: "diver_core::injector",
        pid,
        thread_id,
        stub = format!("{:#x}", stub_address),
        "Bootstrap thread started"
    );

    Ok(InjectionReport {
        pid,
        thread_id,
        bootstrap_address,
        stub_address,
        data_address,
    })
}

/// Write the data block and stub, then start the thread; every allocation lands in `allocations`
fn start_bootstrap<P: RemoteProcess + ?Sized>(
    process: &P,
    request: &InjectionRequest,
    bootstrap_address: u64,
    allocations: &mut Vec<u64>,
) -> Result<(u64, u64, u32)> {
    let (block, layout) = DataBlock::for_request(request);
    let data_address = process.allocate(block.bytes.len(), false)?;
    allocations.push(data_address);
    process.write(data_address, &block.bytes)?;
    debug!(
        target: "diver_core::injector",
        address = format!("{:#x}", data_address),
        size = block.bytes.len(),
        "Wrote bootstrap data block"
    );

    let stub_address = process.allocate(STUB_CAPACITY, true)?;
    allocations.push(stub_address);
    let stub = Assembler::new(process.architecture())
        .bootstrap_stub(stub_address, &layout.at(data_address, bootstrap_address))?;
    if stub.bytes.len() > STUB_CAPACITY {
        return Err(Error::Encoding(format!(
            "bootstrap stub is {} bytes, capacity is {}",
            stub.bytes.len(),
            STUB_CAPACITY
        )));
    }
    process.write(stub_address, &stub.bytes)?;

    let thread_id = process.spawn_thread(stub_address, 0)?;
    Ok((data_address, stub_address, thread_id))
}

fn release<P: RemoteProcess + ?Sized>(process: &P, allocations: &[u64]) {
    for &address in allocations {
        if let Err(e) = process.free(address) {
            warn!(
                target: "diver_core::injector",
                address = format!("{:#x}", address),
                error = %e,
                "Failed to free injection memory"
            );
        }
    }
}

/// Poll `probe` until it reports the agent alive or `timeout` elapses; returns the time waited
pub fn wait_for_agent<F>(mut probe: F, timeout: Duration, poll: Duration) -> Result<Duration>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    loop {
        if probe() {
            let waited = started.elapsed();
            info!(target: "diver_core::injector", waited_ms = waited.as_millis() as u64, "Agent is alive");
            return Ok(waited);
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(target: "diver_core::injector", timeout_ms = timeout.as_millis() as u64, "Agent did not answer");
            return Err(Error::Timeout(format!(
                "agent did not answer within {} ms",
                timeout.as_millis()
            )));
        }
        std::thread::sleep(poll.min(timeout - elapsed));
    }
}
