//! Snapshot runtime
//!
//! Owns the current heap snapshot of the target and turns remote addresses back into live,
//! type-checked object references. Addresses go stale whenever the collector compacts the heap,
//! so every lookup re-validates against a fresh snapshot and falls back to a hash-code scan when
//! the object has moved.
//!
//! All snapshot access is serialized behind one lock.

use crate::frozen::{FrozenObjects, PinnedObject};
use crate::traits::{HeapSnapshot, LiveHeap, ObjectRef, SnapshotSource};
use diver_common::{CandidateObject, Error, HeapType, RemoteAddress, Result, SnapshotConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

type Slot = Option<Box<dyn HeapSnapshot>>;

/// One object found by a heap scan, already converted
#[derive(Debug, Clone)]
struct ScanHit {
    candidate: CandidateObject,
    ty: HeapType,
    object: ObjectRef,
}

pub struct SnapshotRuntime {
    source: Arc<dyn SnapshotSource>,
    live: Arc<dyn LiveHeap>,
    frozen: Arc<FrozenObjects>,
    config: SnapshotConfig,
    state: Mutex<Slot>,
    generation: AtomicU64,
}

impl SnapshotRuntime {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        live: Arc<dyn LiveHeap>,
        frozen: Arc<FrozenObjects>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            source,
            live,
            frozen,
            config,
            state: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn frozen(&self) -> &Arc<FrozenObjects> {
        &self.frozen
    }

    pub fn live(&self) -> &Arc<dyn LiveHeap> {
        &self.live
    }

    /// Number of snapshots captured so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Discard the current snapshot and capture a new one
    pub fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state).map(|_| ())
    }

    /// Release the current snapshot, if any
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.take() {
            Some(snapshot) => {
                snapshot.dispose()?;
                debug!(target: "diver_core::snapshot", "Disposed heap snapshot");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn refresh_locked<'a>(&self, state: &'a mut Slot) -> Result<&'a dyn HeapSnapshot> {
        if let Some(old) = state.take() {
            if let Err(e) = old.dispose() {
                warn!(target: "diver_core::snapshot", error = %e, "Failed to dispose old snapshot");
            }
        }
        let fresh = self.source.capture()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(target: "diver_core::snapshot", generation, "Captured heap snapshot");
        Ok(&**state.insert(fresh))
    }

    fn ensure_locked<'a>(&self, state: &'a mut Slot) -> Result<&'a dyn HeapSnapshot> {
        if state.is_none() {
            return self.refresh_locked(state);
        }
        state
            .as_deref()
            .ok_or_else(|| Error::Snapshot("snapshot slot is empty".to_string()))
    }

    /// Resolve a type by full name, falling back to its short name.
    ///
    /// A miss refreshes the snapshot once, since the target may have loaded new modules.
    pub fn resolve_type(&self, name: &str, module: Option<&str>) -> Result<HeapType> {
        let mut state = self.state.lock();
        let first = find_type(self.ensure_locked(&mut state)?, name, module);
        match first {
            Err(Error::TypeNotFound(_)) => {
                debug!(target: "diver_core::snapshot", type_name = name, "Type not found, refreshing snapshot");
                let snapshot = self.refresh_locked(&mut state)?;
                find_type(snapshot, name, module)
            }
            other => other,
        }
    }

    /// Convert `address` into an object only if it still holds an instance of `expected`
    pub fn checked_object(&self, address: RemoteAddress, expected: &HeapType) -> Result<ObjectRef> {
        let actual = self.live.descriptor_at(address)?;
        if actual != expected.descriptor {
            return Err(Error::StalePointer {
                address: address.0,
                expected: expected.name.clone(),
                actual: format!("descriptor {:#x}", actual),
            });
        }
        // SAFETY: the descriptor at `address` was verified against `expected` above
        unsafe { self.live.object_at(address) }
    }

    /// Live object at `address`, which was last seen holding a `last_known_type`
    pub fn get_heap_object(
        &self,
        address: RemoteAddress,
        last_known_type: &str,
        hash_code: Option<i32>,
    ) -> Result<ObjectRef> {
        // Pinned objects cannot have moved
        if let Some(pinned) = self.frozen.try_get_pinned_object(address) {
            if pinned.type_name() == last_known_type {
                trace!(target: "diver_core::snapshot", address = %address, "Served from pin table");
                return Ok(pinned);
            }
            return Err(Error::StalePointer {
                address: address.0,
                expected: last_known_type.to_string(),
                actual: pinned.type_name().to_string(),
            });
        }

        let mut state = self.state.lock();
        let before = self
            .ensure_locked(&mut state)?
            .type_at(address)
            .map(|t| t.name);

        let snapshot = self.refresh_locked(&mut state)?;
        let current = snapshot.type_at(address);
        let (object, expected) = match current {
            Some(ty) if ty.name == last_known_type => {
                let object = self.checked_object(address, &ty)?;
                (object, ty)
            }
            other => {
                let found = other.map(|t| t.name);
                warn!(
                    target: "diver_core::snapshot",
                    address = %address,
                    expected = last_known_type,
                    before = ?before,
                    after = ?found,
                    "Object moved, searching heap"
                );
                let hash_code = hash_code.ok_or_else(|| Error::StalePointer {
                    address: address.0,
                    expected: last_known_type.to_string(),
                    actual: found.unwrap_or_else(|| "no object".to_string()),
                })?;
                self.relocate_locked(&mut state, last_known_type, hash_code)?
            }
        };

        // The collector may have run between conversion and now
        let descriptor = self.live.descriptor_of(&object)?;
        if descriptor != expected.descriptor {
            return Err(Error::StalePointer {
                address: address.0,
                expected: expected.name,
                actual: format!("descriptor {:#x}", descriptor),
            });
        }
        Ok(object)
    }

    fn relocate_locked(
        &self,
        state: &mut Slot,
        type_name: &str,
        hash_code: i32,
    ) -> Result<(ObjectRef, HeapType)> {
        let hits = self.scan_locked(state, false, &|ty: &HeapType| ty.name == type_name)?;
        let mut matches: Vec<ScanHit> = hits
            .into_iter()
            .filter(|hit| hit.candidate.hash_code == hash_code)
            .collect();
        match matches.len() {
            0 => Err(Error::ObjectLost {
                type_name: type_name.to_string(),
                hash_code,
            }),
            1 => {
                let hit = matches.remove(0);
                info!(
                    target: "diver_core::snapshot",
                    type_name,
                    hash_code,
                    address = %hit.candidate.address,
                    "Relocated moved object"
                );
                Ok((hit.object, hit.ty))
            }
            n => Err(Error::AmbiguousObject {
                type_name: type_name.to_string(),
                hash_code,
                matches: n,
            }),
        }
    }

    /// Every live object whose type satisfies `predicate`
    pub fn enumerate_objects<F>(&self, predicate: F) -> Result<Vec<CandidateObject>>
    where
        F: Fn(&HeapType) -> bool,
    {
        let mut state = self.state.lock();
        let hits = self.scan_locked(&mut state, true, &predicate)?;
        Ok(hits.into_iter().map(|hit| hit.candidate).collect())
    }

    /// Scan with the retry budget; an attempt that trips over a moving object is discarded
    fn scan_locked(
        &self,
        state: &mut Slot,
        refresh_first: bool,
        predicate: &dyn Fn(&HeapType) -> bool,
    ) -> Result<Vec<ScanHit>> {
        let attempts = self.config.scan_retries;
        for attempt in 1..=attempts {
            let snapshot = if attempt > 1 || refresh_first {
                self.refresh_locked(state)?
            } else {
                self.ensure_locked(state)?
            };
            match self.scan_once(snapshot, predicate) {
                Ok(hits) => {
                    debug!(target: "diver_core::snapshot", attempt, found = hits.len(), "Heap scan complete");
                    return Ok(hits);
                }
                Err(e) => {
                    debug!(target: "diver_core::snapshot", attempt, error = %e, "Heap scan attempt discarded");
                }
            }
        }
        warn!(target: "diver_core::snapshot", attempts, "Heap scan retries exhausted");
        Err(Error::ScanRetriesExhausted { attempts })
    }

    fn scan_once(
        &self,
        snapshot: &dyn HeapSnapshot,
        predicate: &dyn Fn(&HeapType) -> bool,
    ) -> Result<Vec<ScanHit>> {
        let mut hits = Vec::new();
        for (address, ty) in snapshot.objects() {
            if !predicate(&ty) {
                continue;
            }
            let object = self.checked_object(address, &ty)?;
            let hash_code = self.live.hash_code(&object)?;
            hits.push(ScanHit {
                candidate: CandidateObject {
                    address,
                    type_full_name: ty.name.clone(),
                    hash_code,
                },
                ty,
                object,
            });
        }
        Ok(hits)
    }

    /// Pin `object` and return its fixed address
    pub fn pin_object(&self, object: &ObjectRef) -> Result<RemoteAddress> {
        let _state = self.state.lock();
        self.frozen.pin(object)
    }

    /// Unpin immediately; false when `address` was not pinned
    pub fn unpin_object(&self, address: RemoteAddress) -> bool {
        let _state = self.state.lock();
        self.frozen.unpin(address)
    }

    /// Remove a pin and hand over its anchor, still holding, for deferred release
    pub fn take_pin(&self, address: RemoteAddress) -> Option<Box<dyn PinnedObject>> {
        let _state = self.state.lock();
        self.frozen.take(address)
    }
}

impl Drop for SnapshotRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(target: "diver_core::snapshot", error = %e, "Failed to dispose snapshot on drop");
        }
    }
}

fn find_type(snapshot: &dyn HeapSnapshot, name: &str, module: Option<&str>) -> Result<HeapType> {
    let types: Vec<HeapType> = snapshot
        .types()
        .into_iter()
        .filter(|t| module.map_or(true, |m| t.module.eq_ignore_ascii_case(m)))
        .collect();

    let exact: Vec<&HeapType> = types.iter().filter(|t| t.name == name).collect();
    let candidates = if exact.is_empty() {
        types.iter().filter(|t| t.short_name() == name).collect()
    } else {
        exact
    };

    let mut seen = HashSet::new();
    let distinct: Vec<&HeapType> = candidates
        .into_iter()
        .filter(|t| seen.insert((t.name.as_str(), t.module.as_str())))
        .collect();

    match distinct.as_slice() {
        [] => Err(Error::TypeNotFound(match module {
            Some(m) => format!("{} in {}", name, m),
            None => name.to_string(),
        })),
        [only] => Ok((*only).clone()),
        many => Err(Error::AmbiguousType {
            name: name.to_string(),
            candidates: many
                .iter()
                .map(|t| format!("{}!{}", t.module, t.name))
                .collect(),
        }),
    }
}
