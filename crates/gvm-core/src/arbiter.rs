//! External resource arbiter seam.
//!
//! The arbiter is an out-of-process scheduler that consumes submission and
//! completion counts per device.  The interposer reaches it through a session
//! located by matching the current device identity, retried until one is
//! found and then kept for the life of the process.  Reports are best-effort:
//! a failed report is logged and dropped, never surfacing to the application.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

use crate::driver::DeviceIdentity;
use crate::error::Result;

/// Which edge of the submission lifecycle an event counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Work was handed to the driver.
    SubmitStart,
    /// Previously submitted work finished on the device.
    SubmitEnd,
}

/// How the arbiter applies `count` to its counter.  Only additive updates are
/// issued today.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventOp {
    #[default]
    Add,
}

/// One report to the arbiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArbiterEvent {
    pub device: DeviceIdentity,
    pub kind: EventKind,
    pub op: EventOp,
    pub count: u64,
}

impl ArbiterEvent {
    pub fn add(device: DeviceIdentity, kind: EventKind, count: u64) -> Self {
        Self {
            device,
            kind,
            op: EventOp::Add,
            count,
        }
    }
}

/// A connected arbiter session.
pub trait Arbiter: Send + Sync {
    fn report(&self, event: &ArbiterEvent) -> Result<()>;
}

/// Finds the arbiter session serving a device, if one has been initialized.
pub trait ArbiterLocator: Send + Sync {
    fn locate(&self, device: &DeviceIdentity) -> Option<Arc<dyn Arbiter>>;
}

impl<F> ArbiterLocator for F
where
    F: Fn(&DeviceIdentity) -> Option<Arc<dyn Arbiter>> + Send + Sync,
{
    fn locate(&self, device: &DeviceIdentity) -> Option<Arc<dyn Arbiter>> {
        self(device)
    }
}

/// Locator that never finds a session: reporting is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoArbiter;

impl ArbiterLocator for NoArbiter {
    fn locate(&self, _device: &DeviceIdentity) -> Option<Arc<dyn Arbiter>> {
        None
    }
}

/// Arbiter that only emits `tracing` events and keeps running totals.
#[derive(Debug, Default)]
pub struct LogArbiter {
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl LogArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(submitted, completed)` totals seen so far.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
        )
    }
}

impl Arbiter for LogArbiter {
    fn report(&self, event: &ArbiterEvent) -> Result<()> {
        let counter = match event.kind {
            EventKind::SubmitStart => &self.submitted,
            EventKind::SubmitEnd => &self.completed,
        };
        counter.fetch_add(event.count, Ordering::Relaxed);
        debug!(
            device = %event.device,
            kind = ?event.kind,
            count = event.count,
            "arbiter event"
        );
        Ok(())
    }
}

/// Lazily-resolved, process-wide arbiter session.
///
/// Every [`connect`](Self::connect) (and so every report) asks the locator
/// until a session turns up; only a found session is cached.  The arbiter may
/// start after the application does.
pub struct ArbiterSession {
    locator: Arc<dyn ArbiterLocator>,
    session: OnceLock<Arc<dyn Arbiter>>,
    missing_logged: AtomicBool,
    failures: AtomicU64,
}

impl ArbiterSession {
    pub fn new(locator: Arc<dyn ArbiterLocator>) -> Self {
        Self {
            locator,
            session: OnceLock::new(),
            missing_logged: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// A session that never reports.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoArbiter))
    }

    /// Resolve the session for `device` unless one was already found.
    /// Returns whether a session is available.
    pub fn connect(&self, device: &DeviceIdentity) -> bool {
        if self.session.get().is_some() {
            return true;
        }
        match self.locator.locate(device) {
            Some(arbiter) => {
                if self.session.set(arbiter).is_ok() {
                    info!(device = %device, "Arbiter session found");
                }
                true
            }
            None => {
                if !self.missing_logged.swap(true, Ordering::Relaxed) {
                    info!(device = %device, "No arbiter session yet; reports dropped until one appears");
                } else {
                    debug!(device = %device, "arbiter session still missing");
                }
                false
            }
        }
    }

    /// Report one event.  Returns `true` if the arbiter accepted it.
    pub fn report(&self, event: ArbiterEvent) -> bool {
        if event.count == 0 || !self.connect(&event.device) {
            return false;
        }
        let Some(arbiter) = self.session.get() else {
            return false;
        };
        match arbiter.report(&event) {
            Ok(()) => true,
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %err,
                    device = %event.device,
                    kind = ?event.kind,
                    count = event.count,
                    "arbiter report failed"
                );
                false
            }
        }
    }

    /// Number of reports the arbiter rejected.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ArbiterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArbiterSession")
            .field("connected", &self.session.get().is_some())
            .field("failures", &self.failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterceptError;
    use std::sync::atomic::AtomicUsize;

    struct Flaky;

    impl Arbiter for Flaky {
        fn report(&self, _event: &ArbiterEvent) -> Result<()> {
            Err(InterceptError::Arbiter("ioctl failed".into()))
        }
    }

    #[test]
    fn locator_is_consulted_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let arbiter = LogArbiter::new();
        let shared: Arc<dyn Arbiter> = arbiter.clone();
        let session = ArbiterSession::new(Arc::new(move |_: &DeviceIdentity| {
            seen.fetch_add(1, Ordering::Relaxed);
            Some(shared.clone())
        }));

        let dev = DeviceIdentity([7; 16]);
        assert!(session.report(ArbiterEvent::add(dev, EventKind::SubmitStart, 3)));
        assert!(session.report(ArbiterEvent::add(dev, EventKind::SubmitEnd, 2)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(arbiter.totals(), (3, 2));
    }

    #[test]
    fn missing_session_is_retried_until_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let arbiter = LogArbiter::new();
        let shared: Arc<dyn Arbiter> = arbiter.clone();
        let session = ArbiterSession::new(Arc::new(move |_: &DeviceIdentity| {
            // Absent on the first lookup, available from the second on.
            (seen.fetch_add(1, Ordering::Relaxed) > 0).then(|| shared.clone())
        }));

        let dev = DeviceIdentity([3; 16]);
        assert!(!session.connect(&dev));
        assert!(session.report(ArbiterEvent::add(dev, EventKind::SubmitStart, 4)));
        assert!(session.report(ArbiterEvent::add(dev, EventKind::SubmitEnd, 4)));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(arbiter.totals(), (4, 4));
    }

    #[test]
    fn failed_reports_are_counted_not_raised() {
        let session = ArbiterSession::new(Arc::new(|_: &DeviceIdentity| {
            Some(Arc::new(Flaky) as Arc<dyn Arbiter>)
        }));
        let ok = session.report(ArbiterEvent::add(
            DeviceIdentity::UNKNOWN,
            EventKind::SubmitStart,
            1,
        ));
        assert!(!ok);
        assert_eq!(session.failures(), 1);
    }

    #[test]
    fn disabled_session_drops_reports() {
        let session = ArbiterSession::disabled();
        assert!(!session.report(ArbiterEvent::add(
            DeviceIdentity::UNKNOWN,
            EventKind::SubmitEnd,
            1
        )));
        assert_eq!(session.failures(), 0);
    }
}
