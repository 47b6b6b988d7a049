//! Core trait definitions for Diver
//!
//! Everything above the OS and runtime boundaries is written against these traits. Windows
//! implementations of the process traits live in `process` and `fork`; the heap and reflection
//! traits are implemented by the runtime binding that hosts the agent.

use diver_common::{
    Architecture, Error, HeapType, Module, PrimitiveValue, RemoteAddress, Result, TypeDump,
};

/// Raw memory access in another process
pub trait RemoteMemory: Send + Sync {
    /// Read exactly `size` bytes at `address`
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Write all of `data` at `address`
    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    fn read_u16(&self, address: u64) -> Result<u16> {
        Ok(u16::from_le_bytes(read_array(self, address)?))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(read_array(self, address)?))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(read_array(self, address)?))
    }

    /// Read a NUL-terminated ASCII string of at most `max_len` bytes
    fn read_c_string(&self, address: u64, max_len: usize) -> Result<String> {
        const CHUNK: usize = 64;
        let mut out = Vec::new();
        let mut cursor = address;
        while out.len() < max_len {
            let chunk = self.read(cursor, CHUNK.min(max_len - out.len()))?;
            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk);
            cursor += chunk.len() as u64;
        }
        Err(Error::MemoryAccess {
            address,
            message: format!("string longer than {} bytes", max_len),
        })
    }
}

/// Read exactly `N` bytes, treating a short read as an access failure
fn read_array<M: RemoteMemory + ?Sized, const N: usize>(memory: &M, address: u64) -> Result<[u8; N]> {
    let bytes = memory.read(address, N)?;
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::MemoryAccess {
            address,
            message: format!("short read: {} of {} bytes", bytes.len(), N),
        })
}

/// A target process opened for injection
pub trait RemoteProcess: RemoteMemory {
    fn pid(&self) -> u32;

    /// Instruction set the target runs, which may differ from ours
    fn architecture(&self) -> Architecture;

    /// Modules visible for the target's architecture
    fn modules(&self) -> Result<Vec<Module>>;

    fn find_module(&self, name: &str) -> Result<Option<Module>> {
        Ok(self.modules()?.into_iter().find(|m| m.matches(name)))
    }

    /// Allocate committed memory in the target
    fn allocate(&self, size: usize, executable: bool) -> Result<u64>;

    fn free(&self, address: u64) -> Result<()>;

    /// Start a thread at `entry` with one pointer-sized parameter; returns the thread id
    fn spawn_thread(&self, entry: u64, parameter: u64) -> Result<u32>;
}

/// Live object handle issued by the runtime binding.
///
/// Equality is by runtime identity: the binding issues one id per live instance, and the id
/// survives the object being moved by a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    id: u64,
    type_name: String,
}

impl ObjectRef {
    pub fn new(id: u64, type_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// A paused, point-in-time view of the target's managed heap
pub trait HeapSnapshot: Send {
    /// Every type of every loaded module
    fn types(&self) -> Vec<HeapType>;

    /// Type of the object at `address`, if the snapshot has one there
    fn type_at(&self, address: RemoteAddress) -> Option<HeapType>;

    /// Every object on the heap with its type
    fn objects(&self) -> Vec<(RemoteAddress, HeapType)>;

    /// Release the paused copy and every OS resource backing it
    fn dispose(self: Box<Self>) -> Result<()>;
}

/// Produces fresh snapshots of one target
pub trait SnapshotSource: Send + Sync {
    fn capture(&self) -> Result<Box<dyn HeapSnapshot>>;
}

/// Access to live objects in the running target
pub trait LiveHeap: Send + Sync {
    /// Type-descriptor pointer stored in the header of whatever sits at `address`
    fn descriptor_at(&self, address: RemoteAddress) -> Result<u64>;

    /// Reinterpret `address` as an object reference without any type check.
    ///
    /// # Safety
    /// The caller must have verified that `address` holds a live object of the type it expects.
    /// Use `SnapshotRuntime::checked_object` instead of calling this directly.
    unsafe fn object_at(&self, address: RemoteAddress) -> Result<ObjectRef>;

    /// Current type-descriptor pointer of a live object
    fn descriptor_of(&self, object: &ObjectRef) -> Result<u64>;

    /// Current address of a live object
    fn address_of(&self, object: &ObjectRef) -> Result<RemoteAddress>;

    /// Identity hash of a live object
    fn hash_code(&self, object: &ObjectRef) -> Result<i32>;
}

/// A value inside the agent, before encoding for the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Primitive(PrimitiveValue),
    Object(ObjectRef),
    Type(HeapType),
}

impl Value {
    /// Runtime type name, `"null"` for null
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Primitive(p) => p.type_name(),
            Value::Object(o) => o.type_name().to_string(),
            Value::Type(_) => "System.RuntimeType".to_string(),
        }
    }
}

/// Reflection over live objects, provided by the runtime binding
pub trait ObjectModel: Send + Sync {
    /// Read a field or property
    fn get_member(&self, object: &ObjectRef, name: &str) -> Result<Value>;

    /// Write a field or property
    fn set_member(&self, object: &ObjectRef, name: &str, value: Value) -> Result<()>;

    /// Call a method; `None` target means a static call. Returns `None` for void methods.
    fn invoke(
        &self,
        target: Option<&ObjectRef>,
        ty: &HeapType,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>>;

    /// Run the constructor matching `args`, on the UI thread when `on_ui_thread` is set
    fn construct(&self, ty: &HeapType, args: Vec<Value>, on_ui_thread: bool) -> Result<ObjectRef>;

    /// Read one item of a collection
    fn get_item(&self, collection: &ObjectRef, index: Value) -> Result<Value>;

    /// Allocate a default-initialized one-dimensional array
    fn create_array(&self, element_type: &HeapType, length: usize) -> Result<ObjectRef>;

    fn set_element(&self, array: &ObjectRef, index: usize, value: Value) -> Result<()>;

    fn describe_type(&self, ty: &HeapType) -> Result<TypeDump>;

    /// Unboxed value when the object is itself a primitive or string
    fn as_primitive(&self, _object: &ObjectRef) -> Option<PrimitiveValue> {
        None
    }
}
