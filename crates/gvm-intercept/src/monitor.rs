//! Completion monitor: the ring's single consumer thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use gvm_core::arbiter::{ArbiterEvent, ArbiterSession, EventKind};
use gvm_core::clock::Clock;
use gvm_core::error::{InterceptError, Result};
use gvm_ring::{CompletionRing, RingConsumer};

use crate::tracker::{LaunchCounters, LaunchRecord, RecordKind};

pub const MONITOR_THREAD_NAME: &str = "gvm-monitor";

/// Inputs of the monitor loop.
pub struct MonitorContext {
    pub counters: Arc<LaunchCounters>,
    pub session: Arc<ArbiterSession>,
    pub clock: Arc<dyn Clock>,
    pub stats_interval: Duration,
    pub idle_poll: Duration,
}

impl MonitorContext {
    /// Account for one completed record.
    fn complete(&self, record: &LaunchRecord) {
        match record.kind {
            RecordKind::Void => {}
            RecordKind::Start => {
                self.counters
                    .started
                    .fetch_add(record.count, Ordering::AcqRel);
            }
            RecordKind::Submission | RecordKind::End => {
                self.counters.ended.fetch_add(record.count, Ordering::AcqRel);
                self.counters
                    .record_latency(self.clock.now().saturating_sub(record.submitted_at));
                self.session.report(ArbiterEvent::add(
                    record.device,
                    EventKind::SubmitEnd,
                    record.count,
                ));
            }
        }
    }

    /// Retire every completed slot at the head of the ring.  Stops at the
    /// first slot still in flight.
    fn poll(&self, consumer: &mut RingConsumer<LaunchRecord>) -> u64 {
        let mut retired = 0;
        while let Some(slot) = consumer.peek(false) {
            match slot.is_complete() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    // A failed query never turns into success later.
                    warn!(ticket = slot.ticket(), error = %err, "completion query failed; retiring");
                }
            }
            self.complete(slot.record());
            slot.retire();
            retired += 1;
        }
        retired
    }

    /// Whether a status line is due at the injected clock's current time;
    /// advances `last` when it is.
    fn status_due(&self, last: &mut Duration) -> bool {
        let now = self.clock.now();
        if now.saturating_sub(*last) < self.stats_interval {
            return false;
        }
        *last = now;
        true
    }

    fn emit_status(&self, ring: &CompletionRing<LaunchRecord>) {
        let stats = self.counters.snapshot();
        info!(
            submitted = stats.submitted,
            started = stats.started,
            ended = stats.ended,
            pending = stats.pending,
            untracked = stats.untracked,
            ring_occupancy = ring.occupancy(),
            max_inflight_us = stats.max_inflight_us,
            "GPU work status"
        );
    }
}

/// What the monitor did over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    /// Slots retired by the polling loop.
    pub retired: u64,
    /// Slots retired by the shutdown drain.
    pub drained: u64,
    /// Status lines logged, the final one at shutdown included.
    pub status_lines: u64,
}

/// Handle to the running monitor thread.
pub struct CompletionMonitor {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<MonitorReport>>,
    shutdown_timeout: Duration,
}

impl CompletionMonitor {
    /// Start the consumer thread on `consumer`'s ring.
    pub fn spawn(
        mut consumer: RingConsumer<LaunchRecord>,
        ctx: MonitorContext,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(MONITOR_THREAD_NAME.into())
            .spawn(move || {
                let ring = Arc::clone(consumer.ring());
                let mut report = MonitorReport::default();
                let mut last_status = ctx.clock.now();
                debug!(capacity = ring.capacity(), "completion monitor started");

                while flag.load(Ordering::Acquire) {
                    let retired = ctx.poll(&mut consumer);
                    report.retired += retired;
                    if ctx.status_due(&mut last_status) {
                        ctx.emit_status(&ring);
                        report.status_lines += 1;
                    }
                    if retired == 0 {
                        thread::park_timeout(ctx.idle_poll);
                    }
                }

                report.drained = consumer.drain_on_shutdown(|record| ctx.complete(record));
                ctx.emit_status(&ring);
                report.status_lines += 1;
                info!(
                    retired = report.retired,
                    drained = report.drained,
                    "completion monitor stopped"
                );
                report
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
            shutdown_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Signal the thread, wait up to the shutdown timeout for the drain to
    /// finish and return its report.
    ///
    /// `Ok(None)` means the thread did not finish in time and was detached.
    pub fn stop(&mut self) -> Result<Option<MonitorReport>> {
        let Some(thread) = self.thread.take() else {
            return Err(InterceptError::NotRunning);
        };
        self.running.store(false, Ordering::Release);
        thread.thread().unpark();

        let deadline = Instant::now() + self.shutdown_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "completion monitor did not stop in time; detaching"
                );
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(1));
        }
        thread
            .join()
            .map(Some)
            .map_err(|_| InterceptError::InvariantViolation("completion monitor panicked".into()))
    }
}

impl Drop for CompletionMonitor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}
