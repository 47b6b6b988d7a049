//! Collector coordination
//!
//! Cleanup that must not run while objects are being inspected (releasing pin anchors, mostly)
//! is queued with [`GcCoordinator::defer`] and dispatched from a background worker when a full
//! collection approaches or completes. When the runtime refuses collector notifications the
//! worker falls back to a periodic timer.

use diver_common::{GcConfig, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of waiting for a collector notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcNotification {
    Succeeded,
    Failed,
    Canceled,
    Timeout,
    /// Notifications are unavailable, e.g. with concurrent collection enabled
    NotApplicable,
}

/// Collector controls exposed by the runtime binding
pub trait CollectorControl: Send + Sync {
    fn register_for_full_gc_notification(
        &self,
        approach_threshold: u32,
        complete_threshold: u32,
    ) -> Result<()>;

    fn cancel_full_gc_notification(&self) -> Result<()>;

    fn wait_for_full_gc_approach(&self, timeout: Duration) -> GcNotification;

    fn wait_for_full_gc_complete(&self, timeout: Duration) -> GcNotification;

    /// Ask the runtime not to collect until `budget_bytes` are allocated; false if it declined
    fn try_start_no_gc_region(&self, budget_bytes: u64) -> Result<bool>;

    fn end_no_gc_region(&self) -> Result<()>;
}

/// How queued cleanup gets dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Notifications,
    Timer,
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct Shared {
    control: Arc<dyn CollectorControl>,
    config: GcConfig,
    running: AtomicBool,
    suppressed: AtomicBool,
    cancelled: AtomicBool,
    queue: Mutex<VecDeque<Cleanup>>,
}

impl Shared {
    /// Run queued cleanup one job at a time until the queue is empty or cleanup stops
    fn dispatch(&self, reason: &str) -> usize {
        let mut count = 0;
        while self.running.load(Ordering::SeqCst) {
            let Some(job) = self.queue.lock().pop_front() else {
                break;
            };
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!(target: "diver_core::gc", reason, "Deferred cleanup panicked");
            }
            count += 1;
        }
        if count > 0 {
            debug!(target: "diver_core::gc", reason, count, "Dispatched deferred cleanup");
        }
        count
    }

    fn enter_suppression(&self) {
        match self
            .control
            .try_start_no_gc_region(self.config.no_gc_budget_bytes)
        {
            Ok(true) => {
                self.suppressed.store(true, Ordering::SeqCst);
                debug!(target: "diver_core::gc", budget = self.config.no_gc_budget_bytes, "Entered no-GC region");
            }
            Ok(false) => debug!(target: "diver_core::gc", "Runtime declined no-GC region"),
            Err(e) => warn!(target: "diver_core::gc", error = %e, "Failed to enter no-GC region"),
        }
    }

    fn exit_suppression(&self) {
        if self.suppressed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.control.end_no_gc_region() {
                warn!(target: "diver_core::gc", error = %e, "Failed to end no-GC region");
            }
        }
    }

    /// Sleep up to `total`, waking early on cancellation; false if cancelled
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        let slice = self.config.poll_interval();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

fn listen(shared: Arc<Shared>) {
    let poll = shared.config.poll_interval();
    while !shared.cancelled.load(Ordering::SeqCst) {
        match shared.control.wait_for_full_gc_approach(poll) {
            GcNotification::Succeeded => {
                shared.dispatch("approach");
                loop {
                    if shared.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    match shared.control.wait_for_full_gc_complete(poll) {
                        GcNotification::Timeout => continue,
                        GcNotification::Canceled => return,
                        _ => break,
                    }
                }
                shared.dispatch("complete");
            }
            GcNotification::Timeout => {}
            GcNotification::Canceled => return,
            status @ (GcNotification::Failed | GcNotification::NotApplicable) => {
                warn!(target: "diver_core::gc", status = ?status, "Collector notifications stopped, using timer");
                tick(shared);
                return;
            }
        }
    }
}

fn tick(shared: Arc<Shared>) {
    let interval = shared.config.cleanup_interval();
    while shared.sleep(interval) {
        shared.dispatch("timer");
    }
}

/// Scoped pause of deferred cleanup; cleanup resumes when the last guard drops
pub struct GcPause<'a> {
    coordinator: &'a GcCoordinator,
}

impl Drop for GcPause<'_> {
    fn drop(&mut self) {
        let mut depth = self.coordinator.pause_depth.lock();
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            self.coordinator.start();
        }
    }
}

/// Coordinates deferred cleanup with the target's collector
pub struct GcCoordinator {
    shared: Arc<Shared>,
    mode: DispatchMode,
    pause_depth: Mutex<usize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GcCoordinator {
    pub fn new(control: Arc<dyn CollectorControl>, config: GcConfig) -> Result<Self> {
        let mode = match control
            .register_for_full_gc_notification(config.approach_threshold, config.complete_threshold)
        {
            Ok(()) => DispatchMode::Notifications,
            Err(e) => {
                warn!(target: "diver_core::gc", error = %e, "Collector notifications unavailable, using timer");
                DispatchMode::Timer
            }
        };

        let shared = Arc::new(Shared {
            control,
            config,
            running: AtomicBool::new(true),
            suppressed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let builder = thread::Builder::new().name("diver-gc".to_string());
        let worker = match mode {
            DispatchMode::Notifications => builder.spawn(move || listen(worker_shared)),
            DispatchMode::Timer => builder.spawn(move || tick(worker_shared)),
        }
        .map_err(|e| diver_common::Error::Internal(format!("failed to start GC worker: {}", e)))?;

        info!(target: "diver_core::gc", mode = ?mode, "GC coordinator started");
        Ok(Self {
            shared,
            mode,
            pause_depth: Mutex::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Queue cleanup for the next dispatch
    pub fn defer(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.shared.queue.lock().push_back(Box::new(cleanup));
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Resume cleanup and end collection suppression
    pub fn start(&self) {
        if !self.shared.running.swap(true, Ordering::SeqCst) {
            self.shared.exit_suppression();
            debug!(target: "diver_core::gc", "Cleanup resumed");
        }
    }

    /// Hold cleanup and suppress full collections within the configured budget
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.enter_suppression();
            debug!(target: "diver_core::gc", "Cleanup stopped");
        }
    }

    /// Stop cleanup for the lifetime of the returned guard
    pub fn pause(&self) -> GcPause<'_> {
        let mut depth = self.pause_depth.lock();
        if *depth == 0 {
            self.stop();
        }
        *depth += 1;
        GcPause { coordinator: self }
    }

    /// Dispatch queued cleanup now
    pub fn flush(&self) -> usize {
        self.shared.dispatch("flush")
    }

    /// Cancel the worker, wait for it and leave any suppression
    pub fn shutdown(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(target: "diver_core::gc", "GC worker panicked");
            }
        }
        if self.mode == DispatchMode::Notifications {
            if let Err(e) = self.shared.control.cancel_full_gc_notification() {
                warn!(target: "diver_core::gc", error = %e, "Failed to cancel collector notifications");
            }
        }
        self.shared.exit_suppression();
        info!(target: "diver_core::gc", pending = self.pending(), "GC coordinator stopped");
    }
}

impl Drop for GcCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
