//! In-memory driver and arbiter for tests and `gvm simulate`.
//!
//! [`SimDriver`] keeps a device capacity, a table of live allocations (so
//! address-range queries work the way the real driver's do) and a set of event
//! objects.  Events complete in record order: a global record sequence is
//! compared against a completion watermark that tests move with
//! [`SimDriver::complete_next`] and [`SimDriver::complete_all`].

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use gvm_core::arbiter::{Arbiter, ArbiterEvent, ArbiterLocator, EventKind};
use gvm_core::driver::{
    CompletionHandle, DeviceIdentity, DevicePtr, DriverApi, KernelLaunch, MemInfo, StreamHandle,
};
use gvm_core::error::{InterceptError, Result};
use gvm_core::ffi_types::{CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_OUT_OF_MEMORY};

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 512;

/// Device identity reported by every [`SimDriver`].
pub const SIM_DEVICE: DeviceIdentity = DeviceIdentity([
    0x51, 0x4d, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
]);

#[derive(Debug, Default)]
struct SimState {
    allocations: HashMap<u64, u64>,
    used: u64,
    /// Event id → record sequence number, `None` until recorded.
    events: HashMap<usize, Option<u64>>,
}

/// Counters describing everything the simulated driver was asked to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimCounters {
    pub allocs: u64,
    pub managed_allocs: u64,
    pub async_allocs: u64,
    pub frees: u64,
    pub launches: u64,
    pub events_created: u64,
    pub events_destroyed: u64,
    pub events_live: u64,
}

#[derive(Debug)]
pub struct SimDriver {
    capacity: u64,
    auto_complete: bool,
    state: Mutex<SimState>,
    next_address: AtomicU64,
    next_event: AtomicU64,
    next_record: AtomicU64,
    completed_below: AtomicU64,
    allocs: AtomicU64,
    managed_allocs: AtomicU64,
    async_allocs: AtomicU64,
    frees: AtomicU64,
    launches: AtomicU64,
    events_created: AtomicU64,
    events_destroyed: AtomicU64,
    fail_next_alloc: AtomicBool,
    fail_launches: AtomicBool,
    fail_event_create: AtomicBool,
    fail_event_record: AtomicBool,
}

impl SimDriver {
    /// A device with `capacity` bytes whose events complete only when told to.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            auto_complete: false,
            state: Mutex::new(SimState::default()),
            next_address: AtomicU64::new(BASE_ADDRESS),
            next_event: AtomicU64::new(1),
            next_record: AtomicU64::new(0),
            completed_below: AtomicU64::new(0),
            allocs: AtomicU64::new(0),
            managed_allocs: AtomicU64::new(0),
            async_allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            launches: AtomicU64::new(0),
            events_created: AtomicU64::new(0),
            events_destroyed: AtomicU64::new(0),
            fail_next_alloc: AtomicBool::new(false),
            fail_launches: AtomicBool::new(false),
            fail_event_create: AtomicBool::new(false),
            fail_event_record: AtomicBool::new(false),
        }
    }

    /// A device whose recorded work completes instantly.
    pub fn auto_completing(capacity: u64) -> Self {
        Self {
            auto_complete: true,
            ..Self::new(capacity)
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the oldest recorded, still pending event.
    pub fn complete_next(&self) {
        let recorded = self.next_record.load(Ordering::Acquire);
        let _ = self
            .completed_below
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |below| {
                (below < recorded).then_some(below + 1)
            });
    }

    /// Complete every event recorded so far.
    pub fn complete_all(&self) {
        let recorded = self.next_record.load(Ordering::Acquire);
        self.completed_below.fetch_max(recorded, Ordering::AcqRel);
    }

    /// Events recorded but not yet complete.
    pub fn pending_events(&self) -> u64 {
        self.next_record
            .load(Ordering::Acquire)
            .saturating_sub(self.completed_below.load(Ordering::Acquire))
    }

    /// Make the next allocation fail inside the driver.
    pub fn fail_next_alloc(&self) {
        self.fail_next_alloc.store(true, Ordering::Release);
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::Release);
    }

    pub fn set_fail_event_create(&self, fail: bool) {
        self.fail_event_create.store(fail, Ordering::Release);
    }

    pub fn set_fail_event_record(&self, fail: bool) {
        self.fail_event_record.store(fail, Ordering::Release);
    }

    /// Bytes currently held by live allocations.
    pub fn used(&self) -> u64 {
        self.state().used
    }

    pub fn counters(&self) -> SimCounters {
        SimCounters {
            allocs: self.allocs.load(Ordering::Relaxed),
            managed_allocs: self.managed_allocs.load(Ordering::Relaxed),
            async_allocs: self.async_allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
            events_created: self.events_created.load(Ordering::Relaxed),
            events_destroyed: self.events_destroyed.load(Ordering::Relaxed),
            events_live: self.state().events.len() as u64,
        }
    }

    fn allocate(&self, size: u64, call: &'static str) -> Result<DevicePtr> {
        if size == 0 {
            return Err(InterceptError::Driver {
                call,
                code: CUDA_ERROR_INVALID_VALUE,
            });
        }
        if self.fail_next_alloc.swap(false, Ordering::AcqRel) {
            return Err(InterceptError::Driver {
                call,
                code: CUDA_ERROR_OUT_OF_MEMORY,
            });
        }
        let mut state = self.state();
        if state.used.saturating_add(size) > self.capacity {
            return Err(InterceptError::Driver {
                call,
                code: CUDA_ERROR_OUT_OF_MEMORY,
            });
        }
        let span = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        let base = self.next_address.fetch_add(span, Ordering::Relaxed);
        state.allocations.insert(base, size);
        state.used += size;
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(DevicePtr(base))
    }

    fn event_id(event: &CompletionHandle) -> usize {
        event.as_raw().addr()
    }
}

impl DriverApi for SimDriver {
    fn mem_get_info(&self) -> Result<MemInfo> {
        let used = self.state().used;
        Ok(MemInfo {
            free: self.capacity.saturating_sub(used),
            total: self.capacity,
        })
    }

    fn mem_alloc(&self, size: u64) -> Result<DevicePtr> {
        self.allocate(size, "cuMemAlloc_v2")
    }

    fn mem_alloc_managed(&self, size: u64) -> Result<DevicePtr> {
        let ptr = self.allocate(size, "cuMemAllocManaged")?;
        self.managed_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    fn mem_alloc_async(&self, size: u64, _stream: StreamHandle) -> Result<DevicePtr> {
        let ptr = self.allocate(size, "cuMemAllocAsync")?;
        self.async_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state();
        let Some(size) = state.allocations.remove(&ptr.0) else {
            return Err(InterceptError::Driver {
                call: "cuMemFree_v2",
                code: CUDA_ERROR_INVALID_VALUE,
            });
        };
        state.used -= size;
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn mem_get_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64)> {
        let state = self.state();
        state
            .allocations
            .iter()
            .find(|&(&base, &size)| ptr.0 >= base && ptr.0 < base + size)
            .map(|(&base, &size)| (DevicePtr(base), size))
            .ok_or(InterceptError::Driver {
                call: "cuMemGetAddressRange_v2",
                code: CUDA_ERROR_INVALID_VALUE,
            })
    }

    unsafe fn launch_kernel(&self, _launch: &KernelLaunch) -> Result<()> {
        if self.fail_launches.load(Ordering::Acquire) {
            return Err(InterceptError::Driver {
                call: "cuLaunchKernel",
                code: CUDA_ERROR_INVALID_VALUE,
            });
        }
        self.launches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn event_create(&self) -> Result<CompletionHandle> {
        if self.fail_event_create.load(Ordering::Acquire) {
            return Err(InterceptError::Driver {
                call: "cuEventCreate",
                code: CUDA_ERROR_OUT_OF_MEMORY,
            });
        }
        let id = self.next_event.fetch_add(1, Ordering::Relaxed) as usize;
        self.state().events.insert(id, None);
        self.events_created.fetch_add(1, Ordering::Relaxed);
        let raw: *mut c_void = std::ptr::without_provenance_mut(id);
        Ok(CompletionHandle::from_raw(raw))
    }

    fn event_record(&self, event: &CompletionHandle, _stream: StreamHandle) -> Result<()> {
        if self.fail_event_record.load(Ordering::Acquire) {
            return Err(InterceptError::Driver {
                call: "cuEventRecord",
                code: CUDA_ERROR_INVALID_VALUE,
            });
        }
        let mut state = self.state();
        let Some(entry) = state.events.get_mut(&Self::event_id(event)) else {
            return Err(InterceptError::Driver {
                call: "cuEventRecord",
                code: CUDA_ERROR_INVALID_VALUE,
            });
        };
        let seq = self.next_record.fetch_add(1, Ordering::AcqRel);
        *entry = Some(seq);
        if self.auto_complete {
            self.completed_below.fetch_max(seq + 1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn event_query(&self, event: &CompletionHandle) -> Result<bool> {
        match self.state().events.get(&Self::event_id(event)) {
            // Never recorded: nothing to wait for.
            Some(None) => Ok(true),
            Some(Some(seq)) => Ok(*seq < self.completed_below.load(Ordering::Acquire)),
            None => Err(InterceptError::Driver {
                call: "cuEventQuery",
                code: CUDA_ERROR_INVALID_VALUE,
            }),
        }
    }

    fn event_synchronize(&self, event: &CompletionHandle) -> Result<()> {
        match self.state().events.get(&Self::event_id(event)) {
            Some(None) => Ok(()),
            Some(Some(seq)) => {
                // Waiting on an event lets all work recorded before it finish.
                self.completed_below.fetch_max(seq + 1, Ordering::AcqRel);
                Ok(())
            }
            None => Err(InterceptError::Driver {
                call: "cuEventSynchronize",
                code: CUDA_ERROR_INVALID_VALUE,
            }),
        }
    }

    fn event_destroy(&self, event: CompletionHandle) -> Result<()> {
        if self.state().events.remove(&Self::event_id(&event)).is_none() {
            return Err(InterceptError::Driver {
                call: "cuEventDestroy_v2",
                code: CUDA_ERROR_INVALID_VALUE,
            });
        }
        self.events_destroyed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn current_device(&self) -> Result<DeviceIdentity> {
        Ok(SIM_DEVICE)
    }
}

// ─── Arbiter ────────────────────────────────────────────────────────────────

/// Arbiter that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingArbiter {
    events: Mutex<Vec<ArbiterEvent>>,
    fail: AtomicBool,
}

impl RecordingArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject every subsequent report.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn events(&self) -> Vec<ArbiterEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of reports of `kind`.
    pub fn reports(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    /// Sum of counts reported for `kind`.
    pub fn total(&self, kind: EventKind) -> u64 {
        self.events()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.count)
            .sum()
    }

    /// A locator that hands this arbiter out for every device.
    pub fn locator(self: &Arc<Self>) -> Arc<dyn ArbiterLocator> {
        let arbiter = Arc::clone(self);
        Arc::new(move |_device: &DeviceIdentity| -> Option<Arc<dyn Arbiter>> {
            Some(arbiter.clone())
        })
    }
}

impl Arbiter for RecordingArbiter {
    fn report(&self, event: &ArbiterEvent) -> Result<()> {
        if self.fail.load(Ordering::Acquire) {
            return Err(InterceptError::Arbiter("arbiter unavailable".into()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_range_covers_interior_pointers() {
        let driver = SimDriver::new(4096);
        let ptr = driver.mem_alloc(600).expect("alloc");
        let (base, size) = driver
            .mem_get_address_range(DevicePtr(ptr.0 + 100))
            .expect("range");
        assert_eq!(base, ptr);
        assert_eq!(size, 600);
        driver.mem_free(ptr).expect("free");
        assert!(driver.mem_get_address_range(ptr).is_err());
        assert_eq!(driver.used(), 0);
    }

    #[test]
    fn events_complete_in_record_order() {
        let driver = SimDriver::new(0);
        let a = driver.event_create().expect("create");
        let b = driver.event_create().expect("create");
        assert!(driver.event_query(&a).expect("query unrecorded"));

        driver.event_record(&a, StreamHandle::DEFAULT).expect("record");
        driver.event_record(&b, StreamHandle::DEFAULT).expect("record");
        assert!(!driver.event_query(&a).expect("query"));

        driver.complete_next();
        assert!(driver.event_query(&a).expect("query"));
        assert!(!driver.event_query(&b).expect("query"));

        driver.event_synchronize(&b).expect("sync");
        assert!(driver.event_query(&b).expect("query"));
        assert_eq!(driver.pending_events(), 0);

        driver.event_destroy(a).expect("destroy");
        driver.event_destroy(b).expect("destroy");
        let counters = driver.counters();
        assert_eq!(counters.events_created, 2);
        assert_eq!(counters.events_destroyed, 2);
        assert_eq!(counters.events_live, 0);
    }

    #[test]
    fn destroying_twice_is_an_error() {
        let driver = SimDriver::new(0);
        let event = driver.event_create().expect("create");
        let raw = event.as_raw();
        driver.event_destroy(event).expect("destroy");
        assert!(
            driver
                .event_destroy(CompletionHandle::from_raw(raw))
                .is_err()
        );
        assert_eq!(driver.counters().events_destroyed, 1);
    }

    #[test]
    fn recording_arbiter_sums_by_kind() {
        let arbiter = RecordingArbiter::new();
        let locator = arbiter.locator();
        let found = locator.locate(&SIM_DEVICE).expect("arbiter");
        found
            .report(&ArbiterEvent::add(SIM_DEVICE, EventKind::SubmitStart, 3))
            .expect("report");
        found
            .report(&ArbiterEvent::add(SIM_DEVICE, EventKind::SubmitStart, 2))
            .expect("report");
        arbiter.set_failing(true);
        assert!(
            found
                .report(&ArbiterEvent::add(SIM_DEVICE, EventKind::SubmitEnd, 1))
                .is_err()
        );
        assert_eq!(arbiter.reports(EventKind::SubmitStart), 2);
        assert_eq!(arbiter.total(EventKind::SubmitStart), 5);
        assert_eq!(arbiter.total(EventKind::SubmitEnd), 0);
    }
}
