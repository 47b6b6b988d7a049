//! Remote PE export resolution
//!
//! Reads the export directory of a module loaded in another process through [`RemoteMemory`].
//! The module may be PE32 or PE32+ regardless of our own bitness, so every structure is read as
//! raw bytes at fixed offsets instead of being cast.

use crate::traits::RemoteMemory;
use diver_common::{Error, Export, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

const DOS_SIGNATURE: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const E_LFANEW_OFFSET: u64 = 0x3C;
/// Signature plus file header
const OPTIONAL_HEADER_OFFSET: u64 = 4 + 20;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const PE32_DATA_DIRECTORY_OFFSET: u64 = 96;
const PE32_PLUS_DATA_DIRECTORY_OFFSET: u64 = 112;
const EXPORT_DIRECTORY_SIZE: usize = 40;
const MAX_EXPORT_NAME: usize = 512;
/// Upper bound on table sizes; anything larger is a corrupt or hostile image
const MAX_EXPORT_ENTRIES: u32 = 0x10000;

/// Image format of a mapped module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Pe32,
    Pe32Plus,
}

#[derive(Debug, Clone, Copy)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

impl DataDirectory {
    fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && rva < self.rva.saturating_add(self.size)
    }
}

fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn invalid(base: u64, reason: impl Into<String>) -> Error {
    Error::InvalidImage {
        base,
        reason: reason.into(),
    }
}

/// Validate headers and return the image kind and its export data directory
fn read_export_directory_entry<M: RemoteMemory + ?Sized>(
    memory: &M,
    base: u64,
) -> Result<(ImageKind, DataDirectory)> {
    if memory.read_u16(base)? != DOS_SIGNATURE {
        return Err(invalid(base, "missing MZ signature"));
    }
    let nt_offset = memory.read_u32(base + E_LFANEW_OFFSET)? as u64;
    let nt = base + nt_offset;
    if memory.read_u32(nt)? != NT_SIGNATURE {
        return Err(invalid(base, "missing PE signature"));
    }

    let optional = nt + OPTIONAL_HEADER_OFFSET;
    let (kind, directory_offset) = match memory.read_u16(optional)? {
        PE32_MAGIC => (ImageKind::Pe32, PE32_DATA_DIRECTORY_OFFSET),
        PE32_PLUS_MAGIC => (ImageKind::Pe32Plus, PE32_PLUS_DATA_DIRECTORY_OFFSET),
        other => {
            return Err(invalid(
                base,
                format!("unknown optional header magic {:#x}", other),
            ))
        }
    };

    // Export table is data directory 0
    let entry = memory.read(optional + directory_offset, 8)?;
    Ok((
        kind,
        DataDirectory {
            rva: le_u32(&entry, 0),
            size: le_u32(&entry, 4),
        },
    ))
}

/// Named exports of one module as read from the target's memory
#[derive(Debug, Clone)]
pub struct ModuleExportTable {
    base: u64,
    kind: ImageKind,
    exports: HashMap<String, Export>,
}

impl ModuleExportTable {
    /// Read every named export of the module mapped at `base`
    pub fn read<M: RemoteMemory + ?Sized>(memory: &M, base: u64) -> Result<Self> {
        let (kind, directory) = read_export_directory_entry(memory, base)?;
        let mut exports = HashMap::new();

        if directory.rva == 0 || directory.size == 0 {
            debug!(target: "diver_core::pe", base = format!("{:#x}", base), "Module has no export directory");
            return Ok(Self {
                base,
                kind,
                exports,
            });
        }

        let header = memory.read(base + directory.rva as u64, EXPORT_DIRECTORY_SIZE)?;
        let ordinal_base = le_u32(&header, 16);
        let function_count = le_u32(&header, 20);
        let name_count = le_u32(&header, 24);
        let functions_rva = le_u32(&header, 28);
        let names_rva = le_u32(&header, 32);
        let ordinals_rva = le_u32(&header, 36);

        if function_count > MAX_EXPORT_ENTRIES || name_count > MAX_EXPORT_ENTRIES {
            return Err(invalid(
                base,
                format!(
                    "export table too large ({} functions, {} names)",
                    function_count, name_count
                ),
            ));
        }
        if name_count == 0 || function_count == 0 {
            return Ok(Self {
                base,
                kind,
                exports,
            });
        }

        let functions = memory.read(base + functions_rva as u64, function_count as usize * 4)?;
        let names = memory.read(base + names_rva as u64, name_count as usize * 4)?;
        let ordinals = memory.read(base + ordinals_rva as u64, name_count as usize * 2)?;

        for i in 0..name_count as usize {
            let name_rva = le_u32(&names, i * 4);
            let index = le_u16(&ordinals, i * 2) as usize;
            if index >= function_count as usize {
                trace!(target: "diver_core::pe", index, "Skipping export with out-of-range ordinal");
                continue;
            }

            let rva = le_u32(&functions, index * 4);
            let name = memory.read_c_string(base + name_rva as u64, MAX_EXPORT_NAME)?;
            let forwarder = if directory.contains(rva) {
                Some(memory.read_c_string(base + rva as u64, MAX_EXPORT_NAME)?)
            } else {
                None
            };

            exports.insert(
                name.clone(),
                Export {
                    name,
                    rva,
                    ordinal: ordinal_base.wrapping_add(index as u32) as u16,
                    forwarder,
                },
            );
        }

        debug!(
            target: "diver_core::pe",
            base = format!("{:#x}", base),
            kind = ?kind,
            count = exports.len(),
            "Read export table"
        );
        Ok(Self {
            base,
            kind,
            exports,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// Absolute address of an export in the target.
    ///
    /// Forwarded exports have no code in this module and are reported as not found.
    pub fn address_of(&self, name: &str) -> Result<u64> {
        match self.exports.get(name) {
            Some(export) if export.forwarder.is_none() => Ok(self.base + export.rva as u64),
            Some(export) => Err(Error::ExportNotFound(format!(
                "{} is forwarded to {}",
                name,
                export.forwarder.as_deref().unwrap_or_default()
            ))),
            None => Err(Error::ExportNotFound(name.to_string())),
        }
    }
}

/// Resolves exports of modules in one target, reading each module's table once
#[derive(Default)]
pub struct ExportResolver {
    tables: Mutex<HashMap<u64, Arc<ModuleExportTable>>>,
}

impl ExportResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export table of the module mapped at `base`
    pub fn table<M: RemoteMemory + ?Sized>(
        &self,
        memory: &M,
        base: u64,
    ) -> Result<Arc<ModuleExportTable>> {
        if let Some(table) = self.tables.lock().get(&base) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(ModuleExportTable::read(memory, base)?);
        self.tables.lock().insert(base, Arc::clone(&table));
        Ok(table)
    }

    /// Absolute address of `name` in the module mapped at `base`
    pub fn resolve<M: RemoteMemory + ?Sized>(&self, memory: &M, base: u64, name: &str) -> Result<u64> {
        let address = self.table(memory, base)?.address_of(name)?;
        debug!(
            target: "diver_core::pe",
            export = name,
            address = format!("{:#x}", address),
            "Resolved remote export"
        );
        Ok(address)
    }

    /// Drop the cached table of a module that was unloaded or remapped
    pub fn invalidate(&self, base: u64) {
        self.tables.lock().remove(&base);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const IMAGE_SIZE: usize = 0x800;
    const EXPORT_DIR_RVA: u32 = 0x200;
    const EXPORT_DIR_SIZE: u32 = 0x200;

    /// Synthetic image exporting `exports` as (name, rva); an rva of 0 marks a forwarder
    pub(crate) fn build_image(kind: ImageKind, exports: &[(&str, u32)]) -> Vec<u8> {
        let mut image = vec![0u8; IMAGE_SIZE];
        let put16 = |img: &mut Vec<u8>, at: usize, v: u16| {
            img[at..at + 2].copy_from_slice(&v.to_le_bytes())
        };
        let put32 = |img: &mut Vec<u8>, at: usize, v: u32| {
            img[at..at + 4].copy_from_slice(&v.to_le_bytes())
        };

        put16(&mut image, 0, DOS_SIGNATURE);
        put32(&mut image, 0x3C, 0x80);
        put32(&mut image, 0x80, NT_SIGNATURE);
        let optional = 0x80 + 24;
        let (magic, dir) = match kind {
            ImageKind::Pe32 => (PE32_MAGIC, PE32_DATA_DIRECTORY_OFFSET as usize),
            ImageKind::Pe32Plus => (PE32_PLUS_MAGIC, PE32_PLUS_DATA_DIRECTORY_OFFSET as usize),
        };
        put16(&mut image, optional, magic);
        put32(&mut image, optional + dir, EXPORT_DIR_RVA);
        put32(&mut image, optional + dir + 4, EXPORT_DIR_SIZE);

        let ed = EXPORT_DIR_RVA as usize;
        let count = exports.len() as u32;
        put32(&mut image, ed + 16, 1);
        put32(&mut image, ed + 20, count);
        put32(&mut image, ed + 24, count);
        put32(&mut image, ed + 28, 0x300);
        put32(&mut image, ed + 32, 0x340);
        put32(&mut image, ed + 36, 0x380);

        let forwarder_at = 0x2C0usize;
        let forwarder = b"OTHER.Target\0";
        image[forwarder_at..forwarder_at + forwarder.len()].copy_from_slice(forwarder);

        let mut string_at = 0x400usize;
        for (i, (name, rva)) in exports.iter().enumerate() {
            let rva = if *rva == 0 { forwarder_at as u32 } else { *rva };
            put32(&mut image, 0x300 + i * 4, rva);
            put32(&mut image, 0x340 + i * 4, string_at as u32);
            put16(&mut image, 0x380 + i * 2, i as u16);
            image[string_at..string_at + name.len()].copy_from_slice(name.as_bytes());
            string_at += name.len() + 1;
        }
        image
    }

    pub(crate) struct ImageMemory {
        pub base: u64,
        pub bytes: Vec<u8>,
    }

    impl RemoteMemory for ImageMemory {
        fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let offset = address.wrapping_sub(self.base) as usize;
            if address < self.base || offset + size > self.bytes.len() {
                return Err(Error::MemoryAccess {
                    address,
                    message: "unmapped".into(),
                });
            }
            Ok(self.bytes[offset..offset + size].to_vec())
        }

        fn write(&self, address: u64, _data: &[u8]) -> Result<()> {
            Err(Error::MemoryAccess {
                address,
                message: "read only".into(),
            })
        }
    }

    #[test]
    fn test_resolve_export_pe32_plus() {
        let memory = ImageMemory {
            base: 0x7FF8_0000_0000,
            bytes: build_image(
                ImageKind::Pe32Plus,
                &[("CLRCreateInstance", 0x1234), ("CorBindToRuntimeEx", 0x1400)],
            ),
        };
        let resolver = ExportResolver::new();
        let address = resolver.resolve(&memory, memory.base, "CLRCreateInstance").unwrap();
        assert_eq!(address, 0x7FF8_0000_1234);
        // Second lookup is served from the cached table and agrees
        assert_eq!(
            resolver.resolve(&memory, memory.base, "CLRCreateInstance").unwrap(),
            address
        );
    }

    #[test]
    fn test_resolve_export_pe32() {
        let memory = ImageMemory {
            base: 0x7000_0000,
            bytes: build_image(ImageKind::Pe32, &[("CLRCreateInstance", 0x2000)]),
        };
        let table = ModuleExportTable::read(&memory, memory.base).unwrap();
        assert_eq!(table.kind(), ImageKind::Pe32);
        assert_eq!(table.address_of("CLRCreateInstance").unwrap(), 0x7000_2000);
    }

    #[test]
    fn test_missing_export() {
        let memory = ImageMemory {
            base: 0x1000_0000,
            bytes: build_image(ImageKind::Pe32Plus, &[("Present", 0x1000)]),
        };
        let err = ExportResolver::new()
            .resolve(&memory, memory.base, "Absent")
            .unwrap_err();
        assert!(matches!(err, Error::ExportNotFound(_)));
    }

    #[test]
    fn test_forwarded_export() {
        let memory = ImageMemory {
            base: 0x1000_0000,
            bytes: build_image(ImageKind::Pe32Plus, &[("Forwarded", 0), ("Local", 0x1000)]),
        };
        let table = ModuleExportTable::read(&memory, memory.base).unwrap();
        let export = table.get("Forwarded").unwrap();
        assert_eq!(export.forwarder.as_deref(), Some("OTHER.Target"));
        assert!(matches!(
            table.address_of("Forwarded"),
            Err(Error::ExportNotFound(_))
        ));
        assert_eq!(table.get("Local").unwrap().ordinal, 2);
    }

    #[test]
    fn test_corrupt_ordinal_base_wraps() {
        let mut bytes = build_image(ImageKind::Pe32Plus, &[("First", 0x1000), ("Second", 0x1100)]);
        let at = EXPORT_DIR_RVA as usize + 16;
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let memory = ImageMemory {
            base: 0x1000_0000,
            bytes,
        };
        let table = ModuleExportTable::read(&memory, memory.base).unwrap();
        assert_eq!(table.get("First").unwrap().ordinal, 0xFFFF);
        assert_eq!(table.get("Second").unwrap().ordinal, 0);
        assert_eq!(table.address_of("Second").unwrap(), 0x1000_1100);
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = build_image(ImageKind::Pe32Plus, &[]);
        bytes[0] = 0;
        let memory = ImageMemory {
            base: 0x1000,
            bytes,
        };
        assert!(matches!(
            ModuleExportTable::read(&memory, 0x1000),
            Err(Error::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_empty_export_table() {
        let memory = ImageMemory {
            base: 0x1000,
            bytes: build_image(ImageKind::Pe32, &[]),
        };
        let table = ModuleExportTable::read(&memory, 0x1000).unwrap();
        assert!(table.is_empty());
    }
}
