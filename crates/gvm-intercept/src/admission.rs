//! Process-wide device memory admission.
//!
//! Bytes are claimed on the ledger with a CAS before the allocation is
//! forwarded and rolled back if the driver refuses it, so concurrent
//! allocators can never jointly overshoot the cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use gvm_core::MIB;
use gvm_core::driver::{DevicePtr, DriverApi};
use gvm_core::error::{InterceptError, Result};

pub struct AdmissionController {
    driver: Arc<dyn DriverApi>,
    limit: Option<u64>,
    total: OnceLock<u64>,
    allocated: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time ledger counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub allocated_bytes: u64,
    /// `None` until the first allocation queries the device.
    pub total_bytes: Option<u64>,
    pub admitted: u64,
    pub rejected: u64,
    pub released: u64,
}

impl AdmissionController {
    /// `limit` caps the effective total below the device capacity.
    pub fn new(driver: Arc<dyn DriverApi>, limit: Option<u64>) -> Self {
        Self {
            driver,
            limit,
            total: OnceLock::new(),
            allocated: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Effective capacity, queried from the device on first use and cached.
    pub fn total(&self) -> Result<u64> {
        if let Some(total) = self.total.get() {
            return Ok(*total);
        }
        let device = self.driver.mem_get_info()?.total;
        let effective = self.limit.map_or(device, |limit| limit.min(device));
        let total = *self.total.get_or_init(|| effective);
        info!(
            device_mb = device / MIB,
            limit_mb = self.limit.map(|l| l / MIB),
            total_mb = total / MIB,
            "Admission capacity resolved"
        );
        Ok(total)
    }

    /// Bytes currently admitted.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Admit `size` bytes, then run `forward` to perform the real allocation.
    ///
    /// Rejects with [`InterceptError::OutOfMemory`] if `allocated + size` would
    /// exceed the total, leaving the ledger untouched.  A failing `forward`
    /// returns the driver's error and rolls the claim back.
    pub fn try_allocate(
        &self,
        size: u64,
        forward: impl FnOnce() -> Result<DevicePtr>,
    ) -> Result<DevicePtr> {
        let total = self.total()?;

        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= total => next,
                _ => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(requested = size, allocated = current, total, "allocation rejected");
                    return Err(InterceptError::OutOfMemory {
                        requested: size,
                        allocated: current,
                        total,
                    });
                }
            };
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        match forward() {
            Ok(ptr) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                let allocated = self.allocated();
                info!(
                    size_mb = size as f64 / MIB as f64,
                    allocated_mb = allocated / MIB,
                    total_mb = total / MIB,
                    "Allocation admitted"
                );
                Ok(ptr)
            }
            Err(err) => {
                self.allocated.fetch_sub(size, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Forward a free and subtract the allocation's size from the ledger.
    ///
    /// The size is recovered from the driver's address-range query.  If that
    /// query fails the free is still forwarded but the ledger is left alone;
    /// if the free itself fails the ledger is also left alone.
    pub fn release(
        &self,
        ptr: DevicePtr,
        forward: impl FnOnce(DevicePtr) -> Result<()>,
    ) -> Result<()> {
        let size = if ptr.0 == 0 {
            None
        } else {
            match self.driver.mem_get_address_range(ptr) {
                Ok((_base, size)) => Some(size),
                Err(err) => {
                    warn!(ptr = ptr.0, error = %err, "address range query failed; ledger unchanged");
                    None
                }
            }
        };

        forward(ptr)?;

        if let Some(size) = size {
            // Allocations made before interception was active were never
            // admitted; clamp at zero instead of wrapping.
            let _ = self
                .allocated
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(size))
                });
            self.released.fetch_add(1, Ordering::Relaxed);
            debug!(size, allocated = self.allocated(), "allocation released");
        }
        Ok(())
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            allocated_bytes: self.allocated(),
            total_bytes: self.total.get().copied(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;
    use std::thread;

    fn controller(capacity: u64, limit: Option<u64>) -> (Arc<SimDriver>, AdmissionController) {
        let driver = Arc::new(SimDriver::new(capacity));
        let admission = AdmissionController::new(driver.clone(), limit);
        (driver, admission)
    }

    #[test]
    fn rejects_exactly_at_the_crossing_allocation() {
        let (driver, admission) = controller(1024, None);

        let first = admission
            .try_allocate(600, || driver.mem_alloc(600))
            .expect("600 fits");
        assert_eq!(admission.allocated(), 600);

        let err = admission
            .try_allocate(500, || driver.mem_alloc(500))
            .expect_err("500 does not fit");
        assert!(matches!(
            err,
            InterceptError::OutOfMemory {
                requested: 500,
                allocated: 600,
                total: 1024
            }
        ));
        assert_eq!(admission.allocated(), 600);

        admission
            .release(first, |p| driver.mem_free(p))
            .expect("free");
        assert_eq!(admission.allocated(), 0);

        admission
            .try_allocate(500, || driver.mem_alloc(500))
            .expect("500 fits after free");
        assert_eq!(admission.allocated(), 500);

        let stats = admission.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.total_bytes, Some(1024));
    }

    #[test]
    fn exact_fit_is_admitted() {
        let (driver, admission) = controller(1024, None);
        admission
            .try_allocate(1024, || driver.mem_alloc(1024))
            .expect("exact fit");
        assert!(admission.try_allocate(1, || driver.mem_alloc(1)).is_err());
    }

    #[test]
    fn rejected_allocation_never_reaches_the_driver() {
        let (driver, admission) = controller(100, None);
        let mut forwarded = false;
        let _ = admission.try_allocate(200, || {
            forwarded = true;
            driver.mem_alloc(200)
        });
        assert!(!forwarded);
        assert_eq!(driver.counters().allocs, 0);
    }

    #[test]
    fn driver_failure_rolls_back_the_claim() {
        let (driver, admission) = controller(1024, None);
        driver.fail_next_alloc();
        let err = admission
            .try_allocate(256, || driver.mem_alloc(256))
            .expect_err("driver refuses");
        assert!(matches!(err, InterceptError::Driver { .. }));
        assert_eq!(admission.allocated(), 0);
        assert_eq!(admission.stats().admitted, 0);
    }

    #[test]
    fn limit_caps_device_capacity() {
        let (driver, admission) = controller(4096, Some(1000));
        assert_eq!(admission.total().expect("total"), 1000);
        assert!(admission.try_allocate(1001, || driver.mem_alloc(1001)).is_err());

        let (_driver, roomy) = controller(4096, Some(1 << 40));
        assert_eq!(roomy.total().expect("total"), 4096);
    }

    #[test]
    fn unknown_pointer_is_forwarded_without_ledger_change() {
        let (driver, admission) = controller(1024, None);
        admission
            .try_allocate(100, || driver.mem_alloc(100))
            .expect("alloc");
        let err = admission
            .release(DevicePtr(0xdead_0000), |p| driver.mem_free(p))
            .expect_err("driver rejects unknown pointer");
        assert!(matches!(err, InterceptError::Driver { .. }));
        assert_eq!(admission.allocated(), 100);
    }

    #[test]
    fn concurrent_admissions_never_overshoot() {
        let (driver, admission) = controller(64 * 100, None);
        let admission = Arc::new(admission);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let admission = Arc::clone(&admission);
                let driver = Arc::clone(&driver);
                thread::spawn(move || {
                    (0..50)
                        .filter(|_| {
                            admission
                                .try_allocate(64, || driver.mem_alloc(64))
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("allocator thread"))
            .sum();

        assert_eq!(admitted, 100);
        assert_eq!(admission.allocated(), 64 * 100);
        assert_eq!(driver.used(), 64 * 100);
    }
}
