//! In-memory target used by the integration tests
//!
//! `FakeProcess` stands in for an opened process with a mapped `mscoree.dll`; `FakeHeap` stands
//! in for a managed heap whose unpinned objects move on every `collect()`.

#![allow(dead_code)]

use diver_common::{
    Architecture, Error, GcConfig, HeapType, MemberKind, Module, RemoteAddress, Result,
    SnapshotConfig, TypeDump, TypeMember,
};
use diver_core::{
    CollectorControl, FrozenObjects, GcCoordinator, GcNotification, HeapSnapshot, LiveHeap,
    ObjectModel, ObjectRef, PinRoutine, RemoteMemory, RemoteProcess, RoutinePinner,
    SnapshotRuntime, SnapshotSource, Value,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

pub const CLR_CREATE_INSTANCE_RVA: u32 = 0x1234;
pub const FAKE_THREAD_ID: u32 = 4242;

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// Minimal mapped image exporting `exports`; an rva of 0 forwards to `OTHER.Target`
pub fn export_image(pe32_plus: bool, exports: &[(&str, u32)]) -> Vec<u8> {
    let mut image = vec![0u8; 0x2000];
    let put16 = |img: &mut Vec<u8>, at: usize, v: u16| img[at..at + 2].copy_from_slice(&v.to_le_bytes());
    let put32 = |img: &mut Vec<u8>, at: usize, v: u32| img[at..at + 4].copy_from_slice(&v.to_le_bytes());

    put16(&mut image, 0, 0x5A4D);
    put32(&mut image, 0x3C, 0x80);
    put32(&mut image, 0x80, 0x4550);
    let optional = 0x80 + 24;
    let (magic, directory) = if pe32_plus { (0x20B, 112) } else { (0x10B, 96) };
    put16(&mut image, optional, magic);
    put32(&mut image, optional + directory, 0x200);
    put32(&mut image, optional + directory + 4, 0x100);

    let count = exports.len() as u32;
    put32(&mut image, 0x200 + 16, 1);
    put32(&mut image, 0x200 + 20, count);
    put32(&mut image, 0x200 + 24, count);
    put32(&mut image, 0x200 + 28, 0x300);
    put32(&mut image, 0x200 + 32, 0x340);
    put32(&mut image, 0x200 + 36, 0x380);

    let forwarder = b"OTHER.Target\0";
    image[0x2C0..0x2C0 + forwarder.len()].copy_from_slice(forwarder);

    let mut name_at = 0x400usize;
    for (i, (name, rva)) in exports.iter().enumerate() {
        put32(&mut image, 0x300 + i * 4, if *rva == 0 { 0x2C0 } else { *rva });
        put32(&mut image, 0x340 + i * 4, name_at as u32);
        put16(&mut image, 0x380 + i * 2, i as u16);
        image[name_at..name_at + name.len()].copy_from_slice(name.as_bytes());
        name_at += name.len() + 1;
    }
    image
}

pub struct FakeProcess {
    architecture: Architecture,
    modules: Vec<Module>,
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next_allocation: Mutex<u64>,
    pub allocations: Mutex<Vec<(u64, usize, bool)>>,
    pub threads: Mutex<Vec<(u64, u64)>>,
    pub frees: Mutex<Vec<u64>>,
    refuse_threads: AtomicBool,
    agent_started: AtomicBool,
}

impl FakeProcess {
    /// Process with `mscoree.dll` exporting `CLRCreateInstance`
    pub fn with_clr(architecture: Architecture) -> Self {
        Self::with_exports(architecture, &[("CLRCreateInstance", CLR_CREATE_INSTANCE_RVA)])
    }

    pub fn with_exports(architecture: Architecture, exports: &[(&str, u32)]) -> Self {
        let base = Self::clr_base(architecture);
        let image = export_image(architecture == Architecture::X64, exports);
        let mut process = Self::without_clr(architecture);
        process.modules.push(Module {
            name: "mscoree.dll".to_string(),
            path: "C:\\Windows\\System32\\MSCOREE.DLL".to_string(),
            base,
            size: image.len() as u64,
        });
        process.regions.get_mut().insert(base, image);
        process
    }

    pub fn without_clr(architecture: Architecture) -> Self {
        let first = match architecture {
            Architecture::X64 => 0x0000_01F0_0000_0000,
            Architecture::X86 => 0x0040_0000,
        };
        Self {
            architecture,
            modules: vec![Module {
                name: "target.exe".to_string(),
                path: "C:\\app\\target.exe".to_string(),
                base: 0x0001_0000,
                size: 0x1000,
            }],
            regions: Mutex::new(BTreeMap::new()),
            next_allocation: Mutex::new(first),
            allocations: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            frees: Mutex::new(Vec::new()),
            refuse_threads: AtomicBool::new(false),
            agent_started: AtomicBool::new(false),
        }
    }

    /// Make every `spawn_thread` fail
    pub fn refuse_threads(&self) {
        self.refuse_threads.store(true, Ordering::SeqCst);
    }

    pub fn clr_base(architecture: Architecture) -> u64 {
        match architecture {
            Architecture::X64 => 0x7FF8_1000_0000,
            Architecture::X86 => 0x7100_0000,
        }
    }

    pub fn agent_started(&self) -> bool {
        self.agent_started.load(Ordering::SeqCst)
    }

    fn region_of(&self, address: u64, size: usize) -> Option<(u64, usize)> {
        let regions = self.regions.lock();
        let (base, bytes) = regions.range(..=address).next_back()?;
        let offset = (address - base) as usize;
        (offset + size <= bytes.len()).then_some((*base, offset))
    }
}

impl RemoteMemory for FakeProcess {
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let (base, offset) = self.region_of(address, size).ok_or(Error::MemoryAccess {
            address,
            message: "unmapped".to_string(),
        })?;
        Ok(self.regions.lock()[&base][offset..offset + size].to_vec())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let (base, offset) = self.region_of(address, data.len()).ok_or(Error::MemoryAccess {
            address,
            message: "unmapped".to_string(),
        })?;
        if let Some(region) = self.regions.lock().get_mut(&base) {
            region[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }
}

impl RemoteProcess for FakeProcess {
    fn pid(&self) -> u32 {
        1337
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn modules(&self) -> Result<Vec<Module>> {
        Ok(self.modules.clone())
    }

    fn allocate(&self, size: usize, executable: bool) -> Result<u64> {
        let mut next = self.next_allocation.lock();
        let address = *next;
        *next += ((size as u64 + 0xFFFF) & !0xFFFF).max(0x10000);
        self.regions.lock().insert(address, vec![0u8; size]);
        self.allocations.lock().push((address, size, executable));
        Ok(address)
    }

    fn free(&self, address: u64) -> Result<()> {
        self.regions.lock().remove(&address);
        self.frees.lock().push(address);
        Ok(())
    }

    fn spawn_thread(&self, entry: u64, parameter: u64) -> Result<u32> {
        if self.refuse_threads.load(Ordering::SeqCst) {
            return Err(Error::ThreadCreation("access denied".to_string()));
        }
        if self.region_of(entry, 1).is_none() {
            return Err(Error::ThreadCreation(format!("entry {:#x} is unmapped", entry)));
        }
        self.threads.lock().push((entry, parameter));
        self.agent_started.store(true, Ordering::SeqCst);
        Ok(FAKE_THREAD_ID)
    }
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeObject {
    pub ty: HeapType,
    pub address: u64,
    pub hash_code: i32,
    pub members: HashMap<String, Value>,
    pub items: Vec<Value>,
    pub pinned: bool,
}

#[derive(Default)]
pub struct World {
    pub types: Vec<HeapType>,
    pub objects: BTreeMap<u64, FakeObject>,
    next_id: u64,
    next_address: u64,
    next_hash: i32,
    /// Remaining `descriptor_at` calls that fail as if the object moved mid-scan
    pub failing_conversions: u32,
    /// Remaining `descriptor_of` calls that see a different type, as if collected mid-lookup
    pub racing_descriptors: u32,
}

impl World {
    fn allocate_address(&mut self) -> u64 {
        self.next_address += 0x40;
        self.next_address
    }

    fn by_address(&self, address: RemoteAddress) -> Option<(u64, &FakeObject)> {
        self.objects
            .iter()
            .find(|(_, o)| o.address == address.0)
            .map(|(id, o)| (*id, o))
    }
}

/// Managed heap, snapshot source, reflection model and pin routine over one [`World`]
#[derive(Clone)]
pub struct FakeHeap {
    world: Arc<Mutex<World>>,
    pub captures: Arc<AtomicUsize>,
    pub disposals: Arc<AtomicUsize>,
}

impl FakeHeap {
    pub fn new() -> Self {
        let world = World {
            next_address: 0x0200_0000,
            next_hash: 1000,
            ..World::default()
        };
        Self {
            world: Arc::new(Mutex::new(world)),
            captures: Arc::new(AtomicUsize::new(0)),
            disposals: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn add_type(&self, name: &str, module: &str) -> HeapType {
        let mut world = self.world.lock();
        let ty = HeapType {
            name: name.to_string(),
            module: module.to_string(),
            descriptor: 0x7000_0000 + world.types.len() as u64 * 0x100,
        };
        world.types.push(ty.clone());
        ty
    }

    /// New object with a fresh identity hash
    pub fn spawn(&self, ty: &HeapType) -> ObjectRef {
        let mut world = self.world.lock();
        world.next_hash += 1;
        let hash = world.next_hash;
        drop(world);
        self.spawn_with_hash(ty, hash)
    }

    pub fn spawn_with_hash(&self, ty: &HeapType, hash_code: i32) -> ObjectRef {
        let mut world = self.world.lock();
        world.next_id += 1;
        let id = world.next_id;
        let address = world.allocate_address();
        world.objects.insert(
            id,
            FakeObject {
                ty: ty.clone(),
                address,
                hash_code,
                members: HashMap::new(),
                items: Vec::new(),
                pinned: false,
            },
        );
        ObjectRef::new(id, ty.name.clone())
    }

    pub fn set(&self, object: &ObjectRef, member: &str, value: Value) {
        if let Some(o) = self.world.lock().objects.get_mut(&object.id()) {
            o.members.insert(member.to_string(), value);
        }
    }

    pub fn set_items(&self, object: &ObjectRef, items: Vec<Value>) {
        if let Some(o) = self.world.lock().objects.get_mut(&object.id()) {
            o.items = items;
        }
    }

    pub fn object(&self, object: &ObjectRef) -> Option<FakeObject> {
        self.world.lock().objects.get(&object.id()).cloned()
    }

    pub fn address(&self, object: &ObjectRef) -> RemoteAddress {
        RemoteAddress(self.world.lock().objects[&object.id()].address)
    }

    pub fn hash(&self, object: &ObjectRef) -> i32 {
        self.world.lock().objects[&object.id()].hash_code
    }

    pub fn is_pinned(&self, object: &ObjectRef) -> bool {
        self.object(object).map_or(false, |o| o.pinned)
    }

    /// Compacting collection: every unpinned object moves to a fresh address
    pub fn collect(&self) {
        let mut world = self.world.lock();
        let ids: Vec<u64> = world
            .objects
            .iter()
            .filter(|(_, o)| !o.pinned)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let address = world.allocate_address();
            if let Some(o) = world.objects.get_mut(&id) {
                o.address = address;
            }
        }
    }

    /// Object becomes unreachable and is collected
    pub fn kill(&self, object: &ObjectRef) {
        self.world.lock().objects.remove(&object.id());
    }

    pub fn fail_next_conversions(&self, count: u32) {
        self.world.lock().failing_conversions = count;
    }

    pub fn race_next_descriptor_reads(&self, count: u32) {
        self.world.lock().racing_descriptors = count;
    }

    fn live(&self, object: &ObjectRef) -> Result<FakeObject> {
        self.object(object).ok_or_else(|| Error::ObjectLost {
            type_name: object.type_name().to_string(),
            hash_code: 0,
        })
    }

    fn type_named(&self, name: &str) -> Option<HeapType> {
        self.world.lock().types.iter().find(|t| t.name == name).cloned()
    }
}

pub struct FakeSnapshot {
    types: Vec<HeapType>,
    objects: Vec<(RemoteAddress, HeapType)>,
    disposals: Arc<AtomicUsize>,
}

impl HeapSnapshot for FakeSnapshot {
    fn types(&self) -> Vec<HeapType> {
        self.types.clone()
    }

    fn type_at(&self, address: RemoteAddress) -> Option<HeapType> {
        self.objects
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, t)| t.clone())
    }

    fn objects(&self) -> Vec<(RemoteAddress, HeapType)> {
        self.objects.clone()
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SnapshotSource for FakeHeap {
    fn capture(&self) -> Result<Box<dyn HeapSnapshot>> {
        let world = self.world.lock();
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSnapshot {
            types: world.types.clone(),
            objects: world
                .objects
                .values()
                .map(|o| (RemoteAddress(o.address), o.ty.clone()))
                .collect(),
            disposals: Arc::clone(&self.disposals),
        }))
    }
}

impl LiveHeap for FakeHeap {
    fn descriptor_at(&self, address: RemoteAddress) -> Result<u64> {
        let mut world = self.world.lock();
        if world.failing_conversions > 0 {
            world.failing_conversions -= 1;
            return Err(Error::MemoryAccess {
                address: address.0,
                message: "object moved during conversion".to_string(),
            });
        }
        world
            .by_address(address)
            .map(|(_, o)| o.ty.descriptor)
            .ok_or(Error::MemoryAccess {
                address: address.0,
                message: "no object header".to_string(),
            })
    }

    unsafe fn object_at(&self, address: RemoteAddress) -> Result<ObjectRef> {
        let world = self.world.lock();
        world
            .by_address(address)
            .map(|(id, o)| ObjectRef::new(id, o.ty.name.clone()))
            .ok_or(Error::MemoryAccess {
                address: address.0,
                message: "no object".to_string(),
            })
    }

    fn descriptor_of(&self, object: &ObjectRef) -> Result<u64> {
        {
            let mut world = self.world.lock();
            if world.racing_descriptors > 0 {
                world.racing_descriptors -= 1;
                return Ok(0xDEAD_0000);
            }
        }
        Ok(self.live(object)?.ty.descriptor)
    }

    fn address_of(&self, object: &ObjectRef) -> Result<RemoteAddress> {
        Ok(RemoteAddress(self.live(object)?.address))
    }

    fn hash_code(&self, object: &ObjectRef) -> Result<i32> {
        Ok(self.live(object)?.hash_code)
    }
}

impl ObjectModel for FakeHeap {
    fn get_member(&self, object: &ObjectRef, name: &str) -> Result<Value> {
        let live = self.live(object)?;
        live.members.get(name).cloned().ok_or_else(|| {
            Error::Protocol(format!("'{}' has no member '{}'", object.type_name(), name))
        })
    }

    fn set_member(&self, object: &ObjectRef, name: &str, value: Value) -> Result<()> {
        self.live(object)?;
        self.set(object, name, value);
        Ok(())
    }

    /// `Describe()` returns the type name, `Clear()` is void, static `Make(name)` constructs
    fn invoke(
        &self,
        target: Option<&ObjectRef>,
        ty: &HeapType,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        match (target, method) {
            (Some(object), "Describe") => Ok(Some(Value::Primitive(
                diver_common::PrimitiveValue::String(object.type_name().to_string()),
            ))),
            (Some(object), "Clear") => {
                if let Some(o) = self.world.lock().objects.get_mut(&object.id()) {
                    o.members.clear();
                }
                Ok(None)
            }
            (None, "Make") => Ok(Some(Value::Object(self.construct(ty, args, false)?))),
            _ => Err(Error::Protocol(format!("no method {}::{}", ty.name, method))),
        }
    }

    /// Arguments land in members `Arg0`, `Arg1`, ...
    fn construct(&self, ty: &HeapType, args: Vec<Value>, _on_ui_thread: bool) -> Result<ObjectRef> {
        let object = self.spawn(ty);
        for (i, arg) in args.into_iter().enumerate() {
            self.set(&object, &format!("Arg{}", i), arg);
        }
        Ok(object)
    }

    fn get_item(&self, collection: &ObjectRef, index: Value) -> Result<Value> {
        let live = self.live(collection)?;
        let position = match index {
            Value::Primitive(diver_common::PrimitiveValue::I32(i)) if i >= 0 => i as usize,
            other => return Err(Error::Protocol(format!("unsupported index {:?}", other))),
        };
        live.items
            .get(position)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("index {} out of range", position)))
    }

    fn create_array(&self, element_type: &HeapType, length: usize) -> Result<ObjectRef> {
        let array_type = match self.type_named(&format!("{}[]", element_type.name)) {
            Some(ty) => ty,
            None => self.add_type(&format!("{}[]", element_type.name), &element_type.module),
        };
        let array = self.spawn(&array_type);
        self.set_items(&array, vec![Value::Null; length]);
        Ok(array)
    }

    fn set_element(&self, array: &ObjectRef, index: usize, value: Value) -> Result<()> {
        let mut world = self.world.lock();
        let live = world
            .objects
            .get_mut(&array.id())
            .ok_or_else(|| Error::Protocol("array is gone".to_string()))?;
        let slot = live
            .items
            .get_mut(index)
            .ok_or_else(|| Error::Protocol(format!("index {} out of range", index)))?;
        *slot = value;
        Ok(())
    }

    /// Members are whatever the first instance of `ty` currently holds
    fn describe_type(&self, ty: &HeapType) -> Result<TypeDump> {
        let world = self.world.lock();
        let mut members: Vec<TypeMember> = world
            .objects
            .values()
            .find(|o| o.ty.name == ty.name)
            .map(|o| {
                o.members
                    .iter()
                    .map(|(name, value)| TypeMember {
                        name: name.clone(),
                        type_name: value.type_name(),
                        kind: if name.starts_with('_') {
                            MemberKind::Field
                        } else {
                            MemberKind::Property
                        },
                        is_static: false,
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(TypeDump {
            type_name: ty.name.clone(),
            module: ty.module.clone(),
            parent: Some("System.Object".to_string()),
            members,
        })
    }
}

impl PinRoutine for FakeHeap {
    fn hold(
        &self,
        object: &ObjectRef,
        ready: &mut dyn FnMut(Result<RemoteAddress>),
        release: &Receiver<()>,
    ) {
        let address = {
            let mut world = self.world.lock();
            match world.objects.get_mut(&object.id()) {
                Some(o) => {
                    o.pinned = true;
                    RemoteAddress(o.address)
                }
                None => {
                    ready(Err(Error::ObjectLost {
                        type_name: object.type_name().to_string(),
                        hash_code: 0,
                    }));
                    return;
                }
            }
        };
        ready(Ok(address));
        let _ = release.recv();
        if let Some(o) = self.world.lock().objects.get_mut(&object.id()) {
            o.pinned = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Collector without notification support, so coordinators fall back to the timer
#[derive(Default)]
pub struct FakeCollector {
    pub no_gc_regions: AtomicU32,
    pub ended_regions: AtomicU32,
}

impl CollectorControl for FakeCollector {
    fn register_for_full_gc_notification(&self, _: u32, _: u32) -> Result<()> {
        Err(Error::NotImplemented("concurrent collection is enabled".to_string()))
    }

    fn cancel_full_gc_notification(&self) -> Result<()> {
        Ok(())
    }

    fn wait_for_full_gc_approach(&self, _: Duration) -> GcNotification {
        GcNotification::NotApplicable
    }

    fn wait_for_full_gc_complete(&self, _: Duration) -> GcNotification {
        GcNotification::NotApplicable
    }

    fn try_start_no_gc_region(&self, _: u64) -> Result<bool> {
        self.no_gc_regions.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn end_no_gc_region(&self) -> Result<()> {
        self.ended_regions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn snapshot_config(scan_retries: u32) -> SnapshotConfig {
    SnapshotConfig { scan_retries }
}

/// Timer mode with a period long enough that only explicit flushes dispatch
pub fn quiet_gc_config() -> GcConfig {
    GcConfig {
        poll_interval_ms: 5,
        cleanup_interval_ms: 60_000,
        ..GcConfig::default()
    }
}

pub fn runtime_over(heap: &FakeHeap, scan_retries: u32) -> Arc<SnapshotRuntime> {
    let frozen = Arc::new(FrozenObjects::new(Arc::new(RoutinePinner::new(heap.clone()))));
    Arc::new(SnapshotRuntime::new(
        Arc::new(heap.clone()),
        Arc::new(heap.clone()),
        frozen,
        snapshot_config(scan_retries),
    ))
}

pub fn coordinator(collector: Arc<FakeCollector>) -> Arc<GcCoordinator> {
    Arc::new(GcCoordinator::new(collector, quiet_gc_config()).expect("gc coordinator"))
}
