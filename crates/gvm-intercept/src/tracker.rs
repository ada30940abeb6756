//! Launch tracking: turning forwarded launches into completion records.
//!
//! The launch is always forwarded first; bookkeeping only runs once the driver
//! accepted it.  Which launches get a ring slot depends on [`TrackingMode`]:
//!
//! - `PerCall`: one record per launch.
//! - `Sampled`: one record per sample interval, carrying the number of
//!   launches since the previous sample.  The interval check is a CAS on the
//!   last-sample timestamp, so exactly one thread wins each interval, and the
//!   coalesced count is taken with a `fetch_max` on the submitted-at-sample
//!   watermark, so no launch is counted by two samples.
//! - `DualEdge`: a start record before the launch and an end record after.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use gvm_core::arbiter::{ArbiterEvent, ArbiterSession, EventKind};
use gvm_core::clock::Clock;
use gvm_core::config::TrackingMode;
use gvm_core::driver::{DeviceIdentity, DriverApi, StreamHandle};
use gvm_core::error::{InterceptError, Result};
use gvm_ring::{CompletionRing, SlotRef};

/// What a ring slot stands for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordKind {
    /// Nothing to account (abandoned or failed reservation).
    #[default]
    Void,
    /// `count` launches submitted up to this point.
    Submission,
    /// The device reached the start of a launch.
    Start,
    /// The device finished a launch.
    End,
}

/// Payload of a ring slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaunchRecord {
    pub kind: RecordKind,
    pub count: u64,
    /// Clock reading when the record was published.
    pub submitted_at: Duration,
    pub device: DeviceIdentity,
}

/// Counters shared by the tracker (producer side) and the monitor.
#[derive(Debug, Default)]
pub struct LaunchCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) tracked: AtomicU64,
    pub(crate) started: AtomicU64,
    pub(crate) ended: AtomicU64,
    pub(crate) untracked: AtomicU64,
    pub(crate) max_inflight_ns: AtomicU64,
    pub(crate) total_inflight_ns: AtomicU64,
    pub(crate) latency_samples: AtomicU64,
}

/// Snapshot of [`LaunchCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LaunchStats {
    /// Launches the driver accepted.
    pub submitted: u64,
    /// Records published to the ring.
    pub tracked: u64,
    /// Launches observed started (dual-edge only).
    pub started: u64,
    /// Launches observed complete.
    pub ended: u64,
    /// Launches that will never be observed (ring full or handle failure).
    pub untracked: u64,
    /// Launches submitted but not yet observed complete.
    pub pending: u64,
    pub max_inflight_us: u64,
    pub mean_inflight_us: u64,
}

impl LaunchCounters {
    pub fn snapshot(&self) -> LaunchStats {
        let submitted = self.submitted.load(Ordering::Acquire);
        let ended = self.ended.load(Ordering::Acquire);
        let untracked = self.untracked.load(Ordering::Acquire);
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total_ns = self.total_inflight_ns.load(Ordering::Relaxed);
        LaunchStats {
            submitted,
            tracked: self.tracked.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            ended,
            untracked,
            pending: submitted.saturating_sub(ended).saturating_sub(untracked),
            max_inflight_us: self.max_inflight_ns.load(Ordering::Relaxed) / 1_000,
            mean_inflight_us: total_ns.checked_div(samples).unwrap_or(0) / 1_000,
        }
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.max_inflight_ns.fetch_max(ns, Ordering::Relaxed);
        self.total_inflight_ns.fetch_add(ns, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }
}

/// Identity of the device the process is working on, looked up once.
pub struct CurrentDevice {
    driver: Arc<dyn DriverApi>,
    resolved: OnceLock<DeviceIdentity>,
}

impl CurrentDevice {
    pub fn new(driver: Arc<dyn DriverApi>) -> Self {
        Self {
            driver,
            resolved: OnceLock::new(),
        }
    }

    /// The current device, or [`DeviceIdentity::UNKNOWN`] while no context is
    /// bound.  Only a successful lookup is cached.
    pub fn get(&self) -> DeviceIdentity {
        if let Some(device) = self.resolved.get() {
            return *device;
        }
        match self.driver.current_device() {
            Ok(device) => *self.resolved.get_or_init(|| device),
            Err(err) => {
                debug!(error = %err, "current device unavailable");
                DeviceIdentity::UNKNOWN
            }
        }
    }
}

/// Timestamp meaning no sample has been taken; the first launch is always due.
const NEVER_SAMPLED: u64 = u64::MAX;

pub struct LaunchTracker {
    mode: TrackingMode,
    blocking: bool,
    sample_interval_ns: u64,
    ring: Arc<CompletionRing<LaunchRecord>>,
    driver: Arc<dyn DriverApi>,
    clock: Arc<dyn Clock>,
    session: Arc<ArbiterSession>,
    device: Arc<CurrentDevice>,
    counters: Arc<LaunchCounters>,
    last_sample_ns: AtomicU64,
    sampled_through: AtomicU64,
}

/// Everything a tracker needs; bundled so construction reads clearly.
pub struct TrackerParts {
    pub mode: TrackingMode,
    pub blocking: bool,
    pub sample_interval: Duration,
    pub ring: Arc<CompletionRing<LaunchRecord>>,
    pub driver: Arc<dyn DriverApi>,
    pub clock: Arc<dyn Clock>,
    pub session: Arc<ArbiterSession>,
    pub device: Arc<CurrentDevice>,
    pub counters: Arc<LaunchCounters>,
}

impl LaunchTracker {
    pub fn new(parts: TrackerParts) -> Self {
        Self {
            mode: parts.mode,
            blocking: parts.blocking,
            sample_interval_ns: parts.sample_interval.as_nanos().min(u64::MAX as u128) as u64,
            ring: parts.ring,
            driver: parts.driver,
            clock: parts.clock,
            session: parts.session,
            device: parts.device,
            counters: parts.counters,
            last_sample_ns: AtomicU64::new(NEVER_SAMPLED),
            sampled_through: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Run `forward` (the real launch) and account for it.
    ///
    /// The driver's result is returned unchanged; tracking failures are logged
    /// and never surface to the caller.
    pub fn on_launch(&self, stream: StreamHandle, forward: impl FnOnce() -> Result<()>) -> Result<()> {
        match self.mode {
            TrackingMode::PerCall => {
                forward()?;
                self.counters.submitted.fetch_add(1, Ordering::AcqRel);
                if !self.track_submission(stream, 1) {
                    self.counters.untracked.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            TrackingMode::Sampled => {
                forward()?;
                let submitted = self.counters.submitted.fetch_add(1, Ordering::AcqRel) + 1;
                if self.sample_due() {
                    self.take_sample(stream, submitted);
                }
                Ok(())
            }
            TrackingMode::DualEdge => self.dual_edge(stream, forward),
        }
    }

    /// Publish one last sample covering the launches since the previous one,
    /// recorded on the default stream.  Only meaningful in sampled mode.
    pub fn flush(&self) {
        if self.mode != TrackingMode::Sampled {
            return;
        }
        let submitted = self.counters.submitted.load(Ordering::Acquire);
        if submitted > self.sampled_through.load(Ordering::Acquire) {
            self.take_sample(StreamHandle::DEFAULT, submitted);
        }
    }

    /// Claim the current sample interval.  At most one caller per interval
    /// gets `true`.
    fn sample_due(&self) -> bool {
        let now = self.now_ns();
        let mut last = self.last_sample_ns.load(Ordering::Acquire);
        loop {
            if last != NEVER_SAMPLED && now.saturating_sub(last) <= self.sample_interval_ns {
                return false;
            }
            match self.last_sample_ns.compare_exchange_weak(
                last,
                now,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }

    fn take_sample(&self, stream: StreamHandle, submitted: u64) {
        let Some(mut slot) = self.reserve() else {
            // Launches stay below the watermark and fold into the next sample.
            return;
        };
        let previous = self.sampled_through.fetch_max(submitted, Ordering::AcqRel);
        let count = submitted.saturating_sub(previous);
        if count == 0 {
            // A later sample already covered these launches.
            return;
        }
        if let Err(err) = self.driver.event_record(slot.handle(), stream) {
            warn!(error = %err, count, "failed to record sample completion");
            self.counters.untracked.fetch_add(count, Ordering::Relaxed);
            return;
        }
        self.publish(&mut slot, RecordKind::Submission, count);
        self.report_start(count);
        slot.publish();
    }

    fn track_submission(&self, stream: StreamHandle, count: u64) -> bool {
        let Some(mut slot) = self.reserve() else {
            return false;
        };
        if let Err(err) = self.driver.event_record(slot.handle(), stream) {
            warn!(error = %err, "failed to record launch completion");
            return false;
        }
        self.publish(&mut slot, RecordKind::Submission, count);
        self.report_start(count);
        slot.publish();
        true
    }

    fn dual_edge(&self, stream: StreamHandle, forward: impl FnOnce() -> Result<()>) -> Result<()> {
        let start = self.reserve().and_then(|slot| {
            match self.driver.event_record(slot.handle(), stream) {
                Ok(()) => Some(slot),
                Err(err) => {
                    warn!(error = %err, "failed to record launch start");
                    None
                }
            }
        });

        // On failure the start slot drops unpublished and becomes void.
        forward()?;
        self.counters.submitted.fetch_add(1, Ordering::AcqRel);

        let Some(mut start) = start else {
            self.counters.untracked.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        self.publish(&mut start, RecordKind::Start, 1);
        // Publish before reserving the end slot: a blocking reserve must never
        // wait behind our own unpublished slot.
        start.publish();

        // The submission is reported only once its end record is secured, so
        // every reported start is matched by a retirement.
        let tracked_end = match self.reserve() {
            Some(mut end) => match self.driver.event_record(end.handle(), stream) {
                Ok(()) => {
                    self.publish(&mut end, RecordKind::End, 1);
                    self.report_start(1);
                    end.publish();
                    true
                }
                Err(err) => {
                    warn!(error = %err, "failed to record launch end");
                    false
                }
            },
            None => false,
        };
        if !tracked_end {
            self.counters.untracked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn reserve(&self) -> Option<SlotRef<'_, LaunchRecord>> {
        match self.ring.reserve(self.blocking) {
            Ok(slot) => Some(slot),
            Err(InterceptError::RingFull) => {
                debug!("completion ring full; launch not tracked");
                None
            }
            Err(err) => {
                warn!(error = %err, "completion slot unavailable; launch not tracked");
                None
            }
        }
    }

    fn publish(&self, slot: &mut SlotRef<'_, LaunchRecord>, kind: RecordKind, count: u64) {
        slot.set_record(LaunchRecord {
            kind,
            count,
            submitted_at: self.clock.now(),
            device: self.device.get(),
        });
        self.counters.tracked.fetch_add(1, Ordering::Relaxed);
    }

    /// Reported before the slot is published so the matching `SubmitEnd`
    /// can never reach the arbiter first.
    fn report_start(&self, count: u64) {
        self.session.report(ArbiterEvent::add(
            self.device.get(),
            EventKind::SubmitStart,
            count,
        ));
    }

    fn now_ns(&self) -> u64 {
        self.clock.now().as_nanos().min(u64::MAX as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingArbiter, SIM_DEVICE, SimDriver};
    use gvm_core::clock::ManualClock;
    use gvm_ring::RingConsumer;
    use std::thread;

    struct Harness {
        driver: Arc<SimDriver>,
        clock: Arc<ManualClock>,
        arbiter: Arc<RecordingArbiter>,
        counters: Arc<LaunchCounters>,
        ring: Arc<CompletionRing<LaunchRecord>>,
        tracker: LaunchTracker,
    }

    fn harness(mode: TrackingMode, capacity: usize, blocking: bool) -> Harness {
        let driver = Arc::new(SimDriver::new(1 << 30));
        let clock = Arc::new(ManualClock::new());
        let arbiter = RecordingArbiter::new();
        let counters = Arc::new(LaunchCounters::default());
        let ring = CompletionRing::new(capacity, driver.clone()).expect("ring");
        let tracker = LaunchTracker::new(TrackerParts {
            mode,
            blocking,
            sample_interval: Duration::from_millis(8),
            ring: ring.clone(),
            driver: driver.clone(),
            clock: clock.clone(),
            session: Arc::new(ArbiterSession::new(arbiter.locator())),
            device: Arc::new(CurrentDevice::new(driver.clone())),
            counters: counters.clone(),
        });
        Harness {
            driver,
            clock,
            arbiter,
            counters,
            ring,
            tracker,
        }
    }

    fn launch(h: &Harness) -> Result<()> {
        h.tracker.on_launch(StreamHandle::DEFAULT, || Ok(()))
    }

    fn published(consumer: &mut RingConsumer<LaunchRecord>) -> Vec<LaunchRecord> {
        let mut out = Vec::new();
        while let Some(slot) = consumer.peek(false) {
            out.push(slot.retire());
        }
        out
    }

    #[test]
    fn five_launches_within_two_ms_make_one_sample() {
        let h = harness(TrackingMode::Sampled, 16, true);
        launch(&h).expect("launch at t=0");
        let mut consumer = h.ring.consumer().expect("consumer");
        assert_eq!(published(&mut consumer).len(), 1);

        for at_us in [6_500, 7_000, 7_500, 8_000, 8_500] {
            h.clock.set(Duration::from_micros(at_us));
            launch(&h).expect("launch");
        }

        let records = published(&mut consumer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Submission);
        assert_eq!(records[0].count, 5);
        assert_eq!(records[0].device, SIM_DEVICE);
        assert_eq!(h.arbiter.reports(EventKind::SubmitStart), 2);
        assert_eq!(h.arbiter.total(EventKind::SubmitStart), 6);
        assert_eq!(h.counters.snapshot().submitted, 6);
    }

    #[test]
    fn first_launch_is_sampled_immediately() {
        let h = harness(TrackingMode::Sampled, 16, true);
        h.clock.set(Duration::from_micros(100));
        launch(&h).expect("launch");
        h.clock.advance(Duration::from_millis(1));
        launch(&h).expect("launch inside the interval");

        let mut consumer = h.ring.consumer().expect("consumer");
        let records = published(&mut consumer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 1);
        assert_eq!(h.arbiter.total(EventKind::SubmitStart), 1);
    }

    #[test]
    fn samples_coalesce_between_intervals() {
        let h = harness(TrackingMode::Sampled, 16, true);
        h.clock.set(Duration::from_millis(10));
        launch(&h).expect("launch");
        for _ in 0..3 {
            h.clock.advance(Duration::from_millis(1));
            launch(&h).expect("launch");
        }
        h.clock.advance(Duration::from_millis(9));
        launch(&h).expect("launch");

        let mut consumer = h.ring.consumer().expect("consumer");
        let counts: Vec<u64> = published(&mut consumer).iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![1, 4]);
        assert_eq!(h.arbiter.total(EventKind::SubmitStart), 5);
    }

    #[test]
    fn concurrent_samplers_never_double_count() {
        let h = Arc::new(harness(TrackingMode::Sampled, 1024, true));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let h = Arc::clone(&h);
                thread::spawn(move || {
                    for _ in 0..200 {
                        h.clock.advance(Duration::from_micros(100));
                        launch(&h).expect("launch");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("launcher thread");
        }
        // Flush whatever is left below the watermark.
        h.clock.advance(Duration::from_millis(20));
        launch(&h).expect("launch");

        let mut consumer = h.ring.consumer().expect("consumer");
        let total: u64 = published(&mut consumer).iter().map(|r| r.count).sum();
        assert_eq!(total, 801);
        assert_eq!(h.arbiter.total(EventKind::SubmitStart), 801);
    }

    #[test]
    fn flush_publishes_the_unsampled_tail() {
        let h = harness(TrackingMode::Sampled, 16, true);
        h.clock.set(Duration::from_millis(9));
        launch(&h).expect("launch");
        launch(&h).expect("launch");
        launch(&h).expect("launch");
        h.tracker.flush();
        h.tracker.flush();

        let mut consumer = h.ring.consumer().expect("consumer");
        let counts: Vec<u64> = published(&mut consumer).iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn per_call_tracks_every_launch() {
        let h = harness(TrackingMode::PerCall, 16, true);
        for _ in 0..3 {
            launch(&h).expect("launch");
        }
        let mut consumer = h.ring.consumer().expect("consumer");
        let records = published(&mut consumer);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.count == 1));
        assert_eq!(h.arbiter.reports(EventKind::SubmitStart), 3);
    }

    #[test]
    fn failed_launch_is_not_tracked() {
        let h = harness(TrackingMode::PerCall, 16, true);
        let err = h
            .tracker
            .on_launch(StreamHandle::DEFAULT, || {
                Err(InterceptError::Driver {
                    call: "cuLaunchKernel",
                    code: 1,
                })
            })
            .expect_err("launch fails");
        assert_eq!(err.cu_result(), 1);
        assert_eq!(h.ring.reserved(), 0);
        assert_eq!(h.counters.snapshot().submitted, 0);
        assert!(h.arbiter.events().is_empty());
    }

    #[test]
    fn full_ring_drops_record_but_not_launch() {
        let h = harness(TrackingMode::PerCall, 2, false);
        for _ in 0..3 {
            launch(&h).expect("launch still succeeds");
        }
        let stats = h.counters.snapshot();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.tracked, 2);
        assert_eq!(stats.untracked, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(h.ring.stats().full_rejections, 1);
    }

    #[test]
    fn full_ring_in_sampled_mode_carries_count_forward() {
        let h = harness(TrackingMode::Sampled, 1, false);
        h.clock.set(Duration::from_millis(9));
        launch(&h).expect("launch");
        h.clock.advance(Duration::from_millis(9));
        launch(&h).expect("launch; ring full, sample skipped");

        let mut consumer = h.ring.consumer().expect("consumer");
        assert_eq!(published(&mut consumer).len(), 1);

        h.clock.advance(Duration::from_millis(9));
        launch(&h).expect("launch");
        let records = published(&mut consumer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
    }

    #[test]
    fn dual_edge_publishes_start_then_end() {
        let h = harness(TrackingMode::DualEdge, 16, true);
        launch(&h).expect("launch");
        launch(&h).expect("launch");

        let mut consumer = h.ring.consumer().expect("consumer");
        let kinds: Vec<RecordKind> = published(&mut consumer).iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::Start,
                RecordKind::End,
                RecordKind::Start,
                RecordKind::End
            ]
        );
        assert_eq!(h.driver.counters().events_created, 4);
        assert_eq!(h.arbiter.total(EventKind::SubmitStart), 2);
    }

    #[test]
    fn dual_edge_without_end_slot_reports_nothing() {
        let h = harness(TrackingMode::DualEdge, 1, false);
        launch(&h).expect("launch");
        assert_eq!(h.counters.snapshot().untracked, 1);
        assert_eq!(h.ring.stats().full_rejections, 1);

        let mut consumer = h.ring.consumer().expect("consumer");
        let records = published(&mut consumer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Start);
        assert_eq!(
            h.arbiter.total(EventKind::SubmitStart),
            h.arbiter.total(EventKind::SubmitEnd)
        );
        assert!(h.arbiter.events().is_empty());
    }

    #[test]
    fn dual_edge_end_record_failure_reports_nothing() {
        let h = harness(TrackingMode::DualEdge, 4, true);
        let driver = h.driver.clone();
        let result = h.tracker.on_launch(StreamHandle::DEFAULT, || {
            driver.set_fail_event_record(true);
            Ok(())
        });
        result.expect("launch");
        assert_eq!(h.counters.snapshot().untracked, 1);
        assert_eq!(h.arbiter.total(EventKind::SubmitStart), 0);
    }

    #[test]
    fn dual_edge_failed_launch_leaves_a_void_slot() {
        let h = harness(TrackingMode::DualEdge, 16, true);
        h.driver.set_fail_launches(true);
        let driver = h.driver.clone();
        let result = h.tracker.on_launch(StreamHandle::DEFAULT, || {
            // SAFETY: the simulator never dereferences launch parameters.
            unsafe {
                driver.launch_kernel(&gvm_core::driver::KernelLaunch::empty(
                    StreamHandle::DEFAULT,
                ))
            }
        });
        assert!(result.is_err());

        let mut consumer = h.ring.consumer().expect("consumer");
        let records = published(&mut consumer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Void);
        assert!(h.arbiter.events().is_empty());
    }

    #[test]
    fn handle_failure_is_invisible_to_the_launch() {
        let h = harness(TrackingMode::PerCall, 4, true);
        h.driver.set_fail_event_create(true);
        launch(&h).expect("launch");
        let stats = h.counters.snapshot();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.untracked, 1);
        assert_eq!(stats.pending, 0);
    }
}
