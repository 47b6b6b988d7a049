//! Frozen object collection
//!
//! Pinned objects keep a fixed address until released. Each object is anchored independently by
//! an [`ObjectPinner`]; [`RoutinePinner`] runs one holding routine per object on its own thread.
//! The table only ever lists addresses whose anchor is still holding.

use crate::traits::ObjectRef;
use diver_common::{Error, RemoteAddress, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anchor keeping one object at a fixed address
pub trait PinnedObject: Send {
    fn address(&self) -> RemoteAddress;

    /// False once the anchor stopped holding the object
    fn is_holding(&self) -> bool;

    /// Stop holding and wait for the anchor to finish
    fn release(self: Box<Self>);
}

pub trait ObjectPinner: Send + Sync {
    /// Anchor `object`; returns once its address is fixed
    fn pin(&self, object: &ObjectRef) -> Result<Box<dyn PinnedObject>>;
}

/// Runtime-side holding routine run by [`RoutinePinner`].
///
/// `hold` must root `object`, report its fixed address through `ready`, then block until
/// `release` yields or disconnects. Returning unpins the object.
pub trait PinRoutine: Send + Sync + 'static {
    fn hold(
        &self,
        object: &ObjectRef,
        ready: &mut dyn FnMut(Result<RemoteAddress>),
        release: &Receiver<()>,
    );
}

/// [`ObjectPinner`] running one holding thread per object
pub struct RoutinePinner<R> {
    routine: Arc<R>,
    ready_timeout: Duration,
}

impl<R: PinRoutine> RoutinePinner<R> {
    pub fn new(routine: R) -> Self {
        Self {
            routine: Arc::new(routine),
            ready_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

impl<R: PinRoutine> ObjectPinner for RoutinePinner<R> {
    fn pin(&self, object: &ObjectRef) -> Result<Box<dyn PinnedObject>> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let routine = Arc::clone(&self.routine);
        let target = object.clone();

        let thread = thread::Builder::new()
            .name(format!("diver-pin-{}", object.id()))
            .spawn(move || {
                let mut ready = |result: Result<RemoteAddress>| {
                    let _ = ready_tx.send(result);
                };
                routine.hold(&target, &mut ready, &release_rx);
            })
            .map_err(|e| Error::Internal(format!("failed to start pin thread: {}", e)))?;

        match ready_rx.recv_timeout(self.ready_timeout) {
            Ok(Ok(address)) => Ok(Box::new(RoutinePin {
                address,
                release: Some(release_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                drop(release_tx);
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                // The routine never reported; disconnect it and leave the thread detached
                drop(release_tx);
                Err(Error::Timeout(format!(
                    "pin routine for object {} did not report an address",
                    object.id()
                )))
            }
        }
    }
}

struct RoutinePin {
    address: RemoteAddress,
    release: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RoutinePin {
    fn shutdown(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "diver_core::frozen", address = %self.address, "Pin routine panicked");
            }
        }
    }
}

impl PinnedObject for RoutinePin {
    fn address(&self) -> RemoteAddress {
        self.address
    }

    fn is_holding(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn release(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for RoutinePin {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PinnedEntry {
    object: ObjectRef,
    anchor: Box<dyn PinnedObject>,
}

#[derive(Default)]
struct PinTable {
    by_address: HashMap<RemoteAddress, PinnedEntry>,
    by_object: HashMap<u64, RemoteAddress>,
}

impl PinTable {
    fn remove(&mut self, address: RemoteAddress) -> Option<PinnedEntry> {
        let entry = self.by_address.remove(&address)?;
        self.by_object.remove(&entry.object.id());
        Some(entry)
    }

    /// Drop entries whose anchor exited on its own
    fn prune(&mut self) {
        let dead: Vec<RemoteAddress> = self
            .by_address
            .iter()
            .filter(|(_, entry)| !entry.anchor.is_holding())
            .map(|(address, _)| *address)
            .collect();
        for address in dead {
            warn!(target: "diver_core::frozen", address = %address, "Pin anchor exited, dropping entry");
            if let Some(entry) = self.remove(address) {
                entry.anchor.release();
            }
        }
    }
}

/// Set of pinned objects keyed by their fixed address
pub struct FrozenObjects {
    pinner: Arc<dyn ObjectPinner>,
    table: Mutex<PinTable>,
}

impl FrozenObjects {
    pub fn new(pinner: Arc<dyn ObjectPinner>) -> Self {
        Self {
            pinner,
            table: Mutex::new(PinTable::default()),
        }
    }

    /// Pin `object` and return its fixed address; pinning it again returns the same address
    pub fn pin(&self, object: &ObjectRef) -> Result<RemoteAddress> {
        let mut table = self.table.lock();
        table.prune();
        if let Some(address) = table.by_object.get(&object.id()) {
            return Ok(*address);
        }

        let anchor = self.pinner.pin(object)?;
        let address = anchor.address();
        if table.by_address.contains_key(&address) {
            anchor.release();
            return Err(Error::Internal(format!(
                "address {} is already pinned for another object",
                address
            )));
        }

        table.by_object.insert(object.id(), address);
        table.by_address.insert(
            address,
            PinnedEntry {
                object: object.clone(),
                anchor,
            },
        );
        info!(
            target: "diver_core::frozen",
            address = %address,
            type_name = object.type_name(),
            pinned = table.by_address.len(),
            "Pinned object"
        );
        Ok(address)
    }

    pub fn try_get_pinning_address(&self, object: &ObjectRef) -> Option<RemoteAddress> {
        let mut table = self.table.lock();
        table.prune();
        table.by_object.get(&object.id()).copied()
    }

    pub fn try_get_pinned_object(&self, address: RemoteAddress) -> Option<ObjectRef> {
        let mut table = self.table.lock();
        table.prune();
        table.by_address.get(&address).map(|e| e.object.clone())
    }

    /// Unpin and wait for the anchor to let go; false when `address` was not pinned
    pub fn unpin(&self, address: RemoteAddress) -> bool {
        let mut table = self.table.lock();
        match table.remove(address) {
            Some(entry) => {
                entry.anchor.release();
                debug!(target: "diver_core::frozen", address = %address, "Unpinned object");
                true
            }
            None => false,
        }
    }

    /// Remove `address` from the set and hand its still-holding anchor to the caller
    pub fn take(&self, address: RemoteAddress) -> Option<Box<dyn PinnedObject>> {
        let mut table = self.table.lock();
        table.remove(address).map(|entry| entry.anchor)
    }

    /// Release every anchor, then clear the set; returns how many were released
    pub fn unpin_all(&self) -> usize {
        let mut table = self.table.lock();
        let count = table.by_address.len();
        for (_, entry) in table.by_address.drain() {
            entry.anchor.release();
        }
        table.by_object.clear();
        if count > 0 {
            info!(target: "diver_core::frozen", count, "Unpinned all objects");
        }
        count
    }

    /// Number of pins whose anchors are still holding
    pub fn len(&self) -> usize {
        let mut table = self.table.lock();
        table.prune();
        table.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<RemoteAddress> {
        let mut table = self.table.lock();
        table.prune();
        let mut addresses: Vec<_> = table.by_address.keys().copied().collect();
        addresses.sort();
        addresses
    }
}

impl Drop for FrozenObjects {
    fn drop(&mut self) {
        self.unpin_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports `0x1000 * id` and counts how many routines are holding
    #[derive(Default)]
    struct CountingRoutine {
        holding: Arc<AtomicUsize>,
    }

    impl PinRoutine for CountingRoutine {
        fn hold(
            &self,
            object: &ObjectRef,
            ready: &mut dyn FnMut(Result<RemoteAddress>),
            release: &Receiver<()>,
        ) {
            if object.type_name() == "Broken" {
                ready(Err(Error::Internal("cannot pin".into())));
                return;
            }
            if object.type_name() == "Fleeting" {
                ready(Ok(RemoteAddress(0x1000 * object.id())));
                return;
            }
            self.holding.fetch_add(1, Ordering::SeqCst);
            ready(Ok(RemoteAddress(0x1000 * object.id())));
            let _ = release.recv();
            self.holding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn frozen() -> (FrozenObjects, Arc<AtomicUsize>) {
        let routine = CountingRoutine::default();
        let holding = Arc::clone(&routine.holding);
        (
            FrozenObjects::new(Arc::new(RoutinePinner::new(routine))),
            holding,
        )
    }

    #[test]
    fn test_pin_and_lookup() {
        let (frozen, holding) = frozen();
        let object = ObjectRef::new(3, "App.User");
        let address = frozen.pin(&object).unwrap();
        assert_eq!(address, RemoteAddress(0x3000));
        assert_eq!(frozen.try_get_pinning_address(&object), Some(address));
        assert_eq!(frozen.try_get_pinned_object(address), Some(object));
        assert_eq!(holding.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pin_twice_is_one_entry() {
        let (frozen, holding) = frozen();
        let object = ObjectRef::new(5, "App.User");
        let first = frozen.pin(&object).unwrap();
        let second = frozen.pin(&object).unwrap();
        assert_eq!(first, second);
        assert_eq!(frozen.len(), 1);
        assert_eq!(holding.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unpin_unknown_address() {
        let (frozen, _) = frozen();
        frozen.pin(&ObjectRef::new(1, "A")).unwrap();
        assert!(!frozen.unpin(RemoteAddress(0xDEAD)));
        assert_eq!(frozen.addresses(), vec![RemoteAddress(0x1000)]);
    }

    #[test]
    fn test_unpin_waits_for_release() {
        let (frozen, holding) = frozen();
        let address = frozen.pin(&ObjectRef::new(2, "A")).unwrap();
        assert!(frozen.unpin(address));
        assert_eq!(holding.load(Ordering::SeqCst), 0);
        assert!(frozen.is_empty());
    }

    #[test]
    fn test_unpin_all_releases_every_anchor() {
        let (frozen, holding) = frozen();
        for id in 1..=4 {
            frozen.pin(&ObjectRef::new(id, "A")).unwrap();
        }
        assert_eq!(holding.load(Ordering::SeqCst), 4);
        assert_eq!(frozen.unpin_all(), 4);
        assert_eq!(holding.load(Ordering::SeqCst), 0);
        assert!(frozen.addresses().is_empty());
    }

    #[test]
    fn test_take_hands_over_anchor() {
        let (frozen, holding) = frozen();
        let address = frozen.pin(&ObjectRef::new(7, "A")).unwrap();
        let anchor = frozen.take(address).unwrap();
        assert!(frozen.try_get_pinned_object(address).is_none());
        assert_eq!(holding.load(Ordering::SeqCst), 1);
        anchor.release();
        assert_eq!(holding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_routine_failure_is_reported() {
        let (frozen, _) = frozen();
        let err = frozen.pin(&ObjectRef::new(9, "Broken")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(frozen.is_empty());
    }

    #[test]
    fn test_exited_anchor_is_not_listed() {
        let (frozen, _) = frozen();
        let kept = frozen.pin(&ObjectRef::new(1, "A")).unwrap();
        let fleeting = ObjectRef::new(2, "Fleeting");
        frozen.pin(&fleeting).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while frozen.addresses().len() > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(frozen.addresses(), vec![kept]);
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen.try_get_pinning_address(&fleeting), None);
    }

    #[test]
    fn test_drop_unpins() {
        let (frozen, holding) = frozen();
        frozen.pin(&ObjectRef::new(1, "A")).unwrap();
        drop(frozen);
        assert_eq!(holding.load(Ordering::SeqCst), 0);
    }
}
