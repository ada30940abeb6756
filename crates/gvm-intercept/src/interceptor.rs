//! Top-level component: one instance per process (or per test).
//!
//! Owns the admission ledger, the completion ring, the launch tracker and the
//! monitor thread.  `start`/`stop` are explicit; whatever attach mechanism the
//! host uses (a preloaded library, a test) calls them.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::info;

use gvm_core::arbiter::{ArbiterLocator, ArbiterSession};
use gvm_core::clock::{Clock, MonotonicClock};
use gvm_core::config::{AllocBacking, InterceptConfig, TrackingMode};
use gvm_core::driver::{DevicePtr, DriverApi, KernelLaunch, StreamHandle};
use gvm_core::error::{InterceptError, Result};
use gvm_ring::CompletionRing;

use crate::admission::{AdmissionController, AdmissionStats};
use crate::monitor::{CompletionMonitor, MonitorContext, MonitorReport};
use crate::tracker::{
    CurrentDevice, LaunchCounters, LaunchRecord, LaunchStats, LaunchTracker, TrackerParts,
};

pub struct Interceptor {
    config: InterceptConfig,
    driver: Arc<dyn DriverApi>,
    clock: Arc<dyn Clock>,
    session: Arc<ArbiterSession>,
    device: Arc<CurrentDevice>,
    counters: Arc<LaunchCounters>,
    ring: Arc<CompletionRing<LaunchRecord>>,
    admission: AdmissionController,
    tracker: LaunchTracker,
    monitor: Mutex<Option<CompletionMonitor>>,
}

/// Everything `gvm` reports about a running interceptor.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct InterceptStats {
    pub running: bool,
    pub tracking: TrackingMode,
    pub admission: AdmissionStats,
    pub launches: LaunchStats,
    pub ring_capacity: u64,
    pub ring_occupancy: u64,
    pub handles_created: u64,
    pub handles_destroyed: u64,
    pub full_rejections: u64,
    pub arbiter_failures: u64,
}

impl Interceptor {
    pub fn new(
        config: InterceptConfig,
        driver: Arc<dyn DriverApi>,
        locator: Arc<dyn ArbiterLocator>,
    ) -> Result<Self> {
        Self::with_clock(config, driver, locator, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: InterceptConfig,
        driver: Arc<dyn DriverApi>,
        locator: Arc<dyn ArbiterLocator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let session = Arc::new(ArbiterSession::new(locator));
        let device = Arc::new(CurrentDevice::new(driver.clone()));
        let counters = Arc::new(LaunchCounters::default());
        let ring = CompletionRing::new(config.ring_capacity, driver.clone())?;
        let admission = AdmissionController::new(driver.clone(), config.memory_limit_bytes());
        let tracker = LaunchTracker::new(TrackerParts {
            mode: config.tracking,
            blocking: config.blocking_reserve,
            sample_interval: config.sample_interval(),
            ring: ring.clone(),
            driver: driver.clone(),
            clock: clock.clone(),
            session: session.clone(),
            device: device.clone(),
            counters: counters.clone(),
        });
        Ok(Self {
            config,
            driver,
            clock,
            session,
            device,
            counters,
            ring,
            admission,
            tracker,
            monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    /// Spawn the completion monitor.
    pub fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return Err(InterceptError::AlreadyStarted);
        }
        let consumer = self.ring.consumer().ok_or(InterceptError::AlreadyStarted)?;
        let ctx = MonitorContext {
            counters: self.counters.clone(),
            session: self.session.clone(),
            clock: self.clock.clone(),
            stats_interval: self.config.stats_interval(),
            idle_poll: self.config.idle_poll(),
        };
        *monitor = Some(CompletionMonitor::spawn(
            consumer,
            ctx,
            self.config.shutdown_timeout(),
        )?);
        info!(
            tracking = self.config.tracking.as_str(),
            ring_capacity = self.config.ring_capacity,
            backing = self.config.alloc_backing.as_str(),
            "Interceptor started"
        );
        Ok(())
    }

    /// Flush the last sample, stop the monitor and wait for it to drain.
    ///
    /// `Ok(None)` if the monitor had to be detached after the shutdown
    /// timeout.
    pub fn stop(&self) -> Result<Option<MonitorReport>> {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut monitor) = monitor else {
            return Err(InterceptError::NotRunning);
        };
        self.tracker.flush();
        monitor.stop()
    }

    pub fn is_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(CompletionMonitor::is_running)
    }

    /// Wrapped allocate: admission check, then the configured allocator.
    pub fn mem_alloc(&self, size: u64) -> Result<DevicePtr> {
        self.connect_arbiter();
        self.admission
            .try_allocate(size, || match self.config.alloc_backing {
                AllocBacking::Device => self.driver.mem_alloc(size),
                AllocBacking::Managed => self.driver.mem_alloc_managed(size),
            })
    }

    /// Wrapped stream-ordered allocate.  Managed backing has no stream-ordered
    /// form, so the stream is ignored there.
    pub fn mem_alloc_async(&self, size: u64, stream: StreamHandle) -> Result<DevicePtr> {
        self.connect_arbiter();
        self.admission
            .try_allocate(size, || match self.config.alloc_backing {
                AllocBacking::Device => self.driver.mem_alloc_async(size, stream),
                AllocBacking::Managed => self.driver.mem_alloc_managed(size),
            })
    }

    pub fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        self.admission.release(ptr, |ptr| self.driver.mem_free(ptr))
    }

    /// Wrapped kernel launch.
    ///
    /// # Safety
    /// `launch` must satisfy the driver's launch contract.
    pub unsafe fn launch_kernel(&self, launch: &KernelLaunch) -> Result<()> {
        self.tracker.on_launch(launch.stream, || {
            // SAFETY: forwarded from this function's contract.
            unsafe { self.driver.launch_kernel(launch) }
        })
    }

    pub fn stats(&self) -> InterceptStats {
        let ring = self.ring.stats();
        InterceptStats {
            running: self.is_running(),
            tracking: self.config.tracking,
            admission: self.admission.stats(),
            launches: self.counters.snapshot(),
            ring_capacity: ring.capacity,
            ring_occupancy: ring.occupancy(),
            handles_created: ring.handles_created,
            handles_destroyed: ring.handles_destroyed,
            full_rejections: ring.full_rejections,
            arbiter_failures: self.session.failures(),
        }
    }

    /// First allocation binds the arbiter session to the current device.
    fn connect_arbiter(&self) {
        self.session.connect(&self.device.get());
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
