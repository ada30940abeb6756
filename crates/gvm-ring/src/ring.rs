//! Completion ring buffer.
//!
//! # Slot protocol
//!
//! ```text
//!            reserve()             publish()              retire()
//!   Free ─────────────► Reserved ────────────► Published ─────────► Free
//!          (event created)        (visible to consumer)   (event destroyed)
//! ```
//!
//! `reserved` counts reservations ever made and `retired` counts slots ever
//! retired.  Neither wraps; the physical slot is `counter % capacity` and the
//! ring is full when `reserved - retired >= capacity`.
//!
//! # Ordering
//!
//! - Producers claim a ticket by CAS on `reserved`, any number concurrently.
//! - A claimed physical slot is only taken over after its state is observed
//!   `Free` (acquire), which the consumer stores (release) before advancing
//!   `retired` (release).
//! - Slot contents are written before the `Published` store (release) and read
//!   after the consumer's `Published` load (acquire).
//! - The consumer is unique per ring ([`CompletionRing::consumer`]) and
//!   retires strictly in ticket order.
//!
//! Protocol violations abort the process: a slot in an unexpected state means a
//! driver event may be leaked or destroyed twice.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use tracing::{error, warn};

use gvm_core::driver::{CompletionHandle, DriverApi};
use gvm_core::error::{InterceptError, Result};

const FREE: u8 = 0;
const RESERVED: u8 = 1;
const PUBLISHED: u8 = 2;

fn state_name(state: u8) -> &'static str {
    match state {
        FREE => "free",
        RESERVED => "reserved",
        PUBLISHED => "published",
        _ => "corrupt",
    }
}

#[cold]
fn invariant_fault(detail: String) -> ! {
    error!(detail = %detail, "completion ring invariant violated; aborting");
    std::process::abort()
}

struct Slot<T> {
    state: AtomicU8,
    handle: UnsafeCell<Option<CompletionHandle>>,
    record: UnsafeCell<T>,
}

impl<T: Default> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            handle: UnsafeCell::new(None),
            record: UnsafeCell::new(T::default()),
        }
    }
}

/// Bounded MPSC ring of completion handles, each carrying a record `T`.
pub struct CompletionRing<T> {
    slots: Box<[Slot<T>]>,
    capacity: u64,
    reserved: CachePadded<AtomicU64>,
    retired: CachePadded<AtomicU64>,
    driver: Arc<dyn DriverApi>,
    consumer_claimed: AtomicBool,
    handles_created: AtomicU64,
    handles_destroyed: AtomicU64,
    full_rejections: AtomicU64,
}

// SAFETY: slot cells are only touched by the ticket owner between Free and
// Published, and by the unique consumer between Published and Free; the state
// atomic orders the hand-over.
unsafe impl<T: Send> Send for CompletionRing<T> {}
unsafe impl<T: Send> Sync for CompletionRing<T> {}

impl<T: Default + Send> CompletionRing<T> {
    /// Allocate a ring of `capacity` slots.  Handles are created lazily on
    /// reservation, so construction does not touch the driver.
    pub fn new(capacity: usize, driver: Arc<dyn DriverApi>) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(InterceptError::Config(
                "completion ring capacity must be > 0".into(),
            ));
        }
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();
        Ok(Arc::new(Self {
            slots: slots.into_boxed_slice(),
            capacity: capacity as u64,
            reserved: CachePadded::new(AtomicU64::new(0)),
            retired: CachePadded::new(AtomicU64::new(0)),
            driver,
            consumer_claimed: AtomicBool::new(false),
            handles_created: AtomicU64::new(0),
            handles_destroyed: AtomicU64::new(0),
            full_rejections: AtomicU64::new(0),
        }))
    }

    /// Claim the next slot and create a fresh completion handle in it.
    ///
    /// Non-blocking callers get [`InterceptError::RingFull`] without any side
    /// effect when the ring is full; blocking callers spin (yielding) until a
    /// retirement frees capacity.
    ///
    /// If the driver cannot create the handle, the slot is published empty so
    /// the consumer skips over it, and the driver error is returned.
    pub fn reserve(&self, blocking: bool) -> Result<SlotRef<'_, T>> {
        let backoff = Backoff::new();
        let ticket = loop {
            let reserved = self.reserved.load(Ordering::Relaxed);
            let retired = self.retired.load(Ordering::Acquire);
            if reserved.saturating_sub(retired) >= self.capacity {
                if !blocking {
                    self.full_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(InterceptError::RingFull);
                }
                backoff.snooze();
                continue;
            }
            match self.reserved.compare_exchange_weak(
                reserved,
                reserved + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break reserved,
                Err(_) => backoff.spin(),
            }
        };

        // A slow consumer may still be retiring the occupant `capacity`
        // tickets behind us.
        let slot = self.slot(ticket);
        let wait = Backoff::new();
        while slot.state.load(Ordering::Acquire) != FREE {
            wait.snooze();
        }
        if let Err(found) =
            slot.state
                .compare_exchange(FREE, RESERVED, Ordering::Acquire, Ordering::Relaxed)
        {
            invariant_fault(format!(
                "ticket {ticket}: slot observed free became {} before reservation",
                state_name(found)
            ));
        }

        match self.driver.event_create() {
            Ok(handle) => {
                self.handles_created.fetch_add(1, Ordering::Relaxed);
                Ok(SlotRef {
                    ring: self,
                    ticket,
                    handle: Some(handle),
                    record: T::default(),
                    committed: false,
                })
            }
            Err(err) => {
                // SAFETY: this thread owns the slot until the Published store.
                unsafe {
                    *slot.handle.get() = None;
                    *slot.record.get() = T::default();
                }
                slot.state.store(PUBLISHED, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Claim the single consumer endpoint.  Returns `None` while another
    /// consumer is alive.
    pub fn consumer(self: &Arc<Self>) -> Option<RingConsumer<T>> {
        self.consumer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RingConsumer {
                ring: Arc::clone(self),
            })
    }
}

impl<T> CompletionRing<T> {
    #[inline]
    fn slot(&self, ticket: u64) -> &Slot<T> {
        &self.slots[(ticket % self.capacity) as usize]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Total reservations ever made.
    #[inline]
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Total slots ever retired.
    #[inline]
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    /// Outstanding slots (`reserved - retired`).
    #[inline]
    pub fn occupancy(&self) -> u64 {
        let retired = self.retired.load(Ordering::Acquire);
        let reserved = self.reserved.load(Ordering::Acquire);
        reserved.saturating_sub(retired)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity,
            reserved: self.reserved(),
            retired: self.retired(),
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_destroyed: self.handles_destroyed.load(Ordering::Relaxed),
            full_rejections: self.full_rejections.load(Ordering::Relaxed),
        }
    }

    fn destroy_handle(&self, handle: CompletionHandle, ticket: u64) {
        if let Err(err) = self.driver.event_destroy(handle) {
            warn!(ticket, error = %err, "failed to destroy completion handle");
        }
        self.handles_destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T> Drop for CompletionRing<T> {
    fn drop(&mut self) {
        let retired = *self.retired.get_mut();
        let handles: Vec<CompletionHandle> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.handle.get_mut().take())
            .collect();
        let leftover = handles.len();
        for handle in handles {
            self.destroy_handle(handle, retired);
        }
        if leftover > 0 {
            warn!(
                leftover,
                "completion ring dropped with undrained handles; destroyed without waiting"
            );
        }
    }
}

impl<T> fmt::Debug for CompletionRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRing")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Point-in-time ring counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: u64,
    pub reserved: u64,
    pub retired: u64,
    pub handles_created: u64,
    pub handles_destroyed: u64,
    /// Non-blocking reservations refused because the ring was full.
    pub full_rejections: u64,
}

impl RingStats {
    pub fn occupancy(&self) -> u64 {
        self.reserved.saturating_sub(self.retired)
    }
}

// ─── Producer side ──────────────────────────────────────────────────────────

/// A reserved, not yet published slot.
///
/// Record asynchronous work against [`handle`](Self::handle), fill in the
/// record, then [`publish`](Self::publish).  Dropping an unpublished slot
/// publishes it with a default record so the consumer never stalls behind it.
pub struct SlotRef<'a, T: Default> {
    ring: &'a CompletionRing<T>,
    ticket: u64,
    handle: Option<CompletionHandle>,
    record: T,
    committed: bool,
}

impl<T: Default> SlotRef<'_, T> {
    #[inline]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn handle(&self) -> &CompletionHandle {
        match &self.handle {
            Some(handle) => handle,
            None => invariant_fault(format!(
                "ticket {}: handle accessed after publish",
                self.ticket
            )),
        }
    }

    pub fn record_mut(&mut self) -> &mut T {
        &mut self.record
    }

    pub fn set_record(&mut self, record: T) {
        self.record = record;
    }

    /// Make the slot visible to the consumer.
    pub fn publish(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        let slot = self.ring.slot(self.ticket);
        // SAFETY: the slot is Reserved by this ticket; nobody else reads or
        // writes its cells until the Published store below.
        unsafe {
            *slot.handle.get() = self.handle.take();
            *slot.record.get() = std::mem::take(&mut self.record);
        }
        if let Err(found) = slot.state.compare_exchange(
            RESERVED,
            PUBLISHED,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            invariant_fault(format!(
                "ticket {}: publish found slot {}",
                self.ticket,
                state_name(found)
            ));
        }
    }
}

impl<T: Default> Drop for SlotRef<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.record = T::default();
            self.commit();
        }
    }
}

// ─── Consumer side ──────────────────────────────────────────────────────────

/// The single consumer endpoint of a ring.  Releases its claim on drop.
pub struct RingConsumer<T> {
    ring: Arc<CompletionRing<T>>,
}

impl<T: Default + Send> RingConsumer<T> {
    pub fn ring(&self) -> &Arc<CompletionRing<T>> {
        &self.ring
    }

    /// The oldest unretired slot, if it has been published.
    ///
    /// A reserved but unpublished head is treated like an empty ring: the
    /// consumer never skips ahead of publication.  Blocking callers spin
    /// (yielding) until a slot is ready.
    pub fn peek(&mut self, blocking: bool) -> Option<ReadySlot<'_, T>> {
        let backoff = Backoff::new();
        loop {
            let retired = self.ring.retired.load(Ordering::Relaxed);
            let reserved = self.ring.reserved.load(Ordering::Acquire);
            if retired == reserved
                || self.ring.slot(retired).state.load(Ordering::Acquire) != PUBLISHED
            {
                if !blocking {
                    return None;
                }
                backoff.snooze();
                continue;
            }
            return Some(ReadySlot {
                ring: self.ring.as_ref(),
                ticket: retired,
                _consumer: PhantomData,
            });
        }
    }

    /// Wait for every outstanding slot to complete, destroy its handle and
    /// retire it, calling `on_complete` with each record in ticket order.
    ///
    /// Drains up to the reservation count observed on entry; producers should
    /// be quiescent.  Returns the number of slots drained.
    pub fn drain_on_shutdown(&mut self, mut on_complete: impl FnMut(&T)) -> u64 {
        let ring = Arc::clone(&self.ring);
        let end = ring.reserved();
        let mut drained = 0u64;
        while ring.retired.load(Ordering::Relaxed) < end {
            let Some(slot) = self.peek(true) else {
                break;
            };
            if let Some(handle) = slot.handle()
                && let Err(err) = ring.driver.event_synchronize(handle)
            {
                warn!(
                    ticket = slot.ticket(),
                    error = %err,
                    "completion handle failed to synchronize during drain"
                );
            }
            on_complete(slot.record());
            slot.retire();
            drained += 1;
        }
        drained
    }
}

impl<T> Drop for RingConsumer<T> {
    fn drop(&mut self) {
        self.ring.consumer_claimed.store(false, Ordering::Release);
    }
}

/// A published head slot, borrowed from the consumer.
pub struct ReadySlot<'a, T> {
    ring: &'a CompletionRing<T>,
    ticket: u64,
    _consumer: PhantomData<&'a mut RingConsumer<T>>,
}

impl<T: Default> ReadySlot<'_, T> {
    #[inline]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// The slot's handle, or `None` for a slot whose handle could not be
    /// created.
    pub fn handle(&self) -> Option<&CompletionHandle> {
        // SAFETY: Published slots are owned by the consumer until retired.
        unsafe { (*self.ring.slot(self.ticket).handle.get()).as_ref() }
    }

    pub fn record(&self) -> &T {
        // SAFETY: Published slots are owned by the consumer until retired.
        unsafe { &*self.ring.slot(self.ticket).record.get() }
    }

    /// Non-blocking completion check.  Empty slots are always complete.
    pub fn is_complete(&self) -> Result<bool> {
        match self.handle() {
            Some(handle) => self.ring.driver.event_query(handle),
            None => Ok(true),
        }
    }

    /// Destroy the handle, return the slot to Free and advance `retired`, in
    /// that order.  Returns the slot's record.
    pub fn retire(self) -> T {
        let ring = self.ring;
        let current = ring.retired.load(Ordering::Relaxed);
        if current != self.ticket {
            invariant_fault(format!(
                "retire of ticket {} while retirement counter is at {current}",
                self.ticket
            ));
        }
        let slot = ring.slot(self.ticket);
        let state = slot.state.load(Ordering::Acquire);
        if state != PUBLISHED {
            invariant_fault(format!(
                "retire of ticket {} found slot {}",
                self.ticket,
                state_name(state)
            ));
        }

        // SAFETY: Published head slot, exclusively owned by the consumer.
        let (handle, record) = unsafe {
            (
                (*slot.handle.get()).take(),
                std::mem::take(&mut *slot.record.get()),
            )
        };
        if let Some(handle) = handle {
            ring.destroy_handle(handle, self.ticket);
        }
        slot.state.store(FREE, Ordering::Release);
        ring.retired.store(self.ticket + 1, Ordering::Release);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvm_core::driver::{DeviceIdentity, DevicePtr, KernelLaunch, MemInfo, StreamHandle};
    use gvm_core::ffi_types::CUDA_ERROR_OUT_OF_MEMORY;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    /// Minimal event-only driver: events complete when the test says so.
    #[derive(Default)]
    struct EventDriver {
        next: AtomicU64,
        live: Mutex<HashSet<usize>>,
        completed_below: AtomicU64,
        synchronized: AtomicU64,
        fail_create: AtomicBool,
    }

    impl EventDriver {
        fn live(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    impl DriverApi for EventDriver {
        fn mem_get_info(&self) -> Result<MemInfo> {
            unimplemented!()
        }
        fn mem_alloc(&self, _size: u64) -> Result<DevicePtr> {
            unimplemented!()
        }
        fn mem_alloc_managed(&self, _size: u64) -> Result<DevicePtr> {
            unimplemented!()
        }
        fn mem_alloc_async(&self, _size: u64, _stream: StreamHandle) -> Result<DevicePtr> {
            unimplemented!()
        }
        fn mem_free(&self, _ptr: DevicePtr) -> Result<()> {
            unimplemented!()
        }
        fn mem_get_address_range(&self, _ptr: DevicePtr) -> Result<(DevicePtr, u64)> {
            unimplemented!()
        }
        unsafe fn launch_kernel(&self, _launch: &KernelLaunch) -> Result<()> {
            unimplemented!()
        }
        fn event_create(&self) -> Result<CompletionHandle> {
            if self.fail_create.load(Ordering::Relaxed) {
                return Err(InterceptError::Driver {
                    call: "cuEventCreate",
                    code: CUDA_ERROR_OUT_OF_MEMORY,
                });
            }
            let id = self.next.fetch_add(1, Ordering::Relaxed) as usize + 1;
            self.live.lock().unwrap().insert(id);
            Ok(CompletionHandle::from_raw(id as *mut _))
        }
        fn event_record(&self, _event: &CompletionHandle, _stream: StreamHandle) -> Result<()> {
            Ok(())
        }
        fn event_query(&self, event: &CompletionHandle) -> Result<bool> {
            Ok((event.as_raw() as u64) <= self.completed_below.load(Ordering::Acquire))
        }
        fn event_synchronize(&self, event: &CompletionHandle) -> Result<()> {
            self.synchronized.fetch_add(1, Ordering::Relaxed);
            self.completed_below
                .fetch_max(event.as_raw() as u64, Ordering::AcqRel);
            Ok(())
        }
        fn event_destroy(&self, event: CompletionHandle) -> Result<()> {
            let removed = self.live.lock().unwrap().remove(&(event.as_raw() as usize));
            assert!(removed, "double destroy of {:?}", event.as_raw());
            Ok(())
        }
        fn current_device(&self) -> Result<DeviceIdentity> {
            Ok(DeviceIdentity::UNKNOWN)
        }
    }

    fn ring(capacity: usize) -> (Arc<EventDriver>, Arc<CompletionRing<u64>>) {
        let driver = Arc::new(EventDriver::default());
        let ring = CompletionRing::new(capacity, driver.clone()).expect("ring");
        (driver, ring)
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let driver = Arc::new(EventDriver::default());
        assert!(CompletionRing::<u64>::new(0, driver).is_err());
    }

    #[test]
    fn backpressure_full_then_free_after_retire() {
        let (driver, ring) = ring(2);
        let mut consumer = ring.consumer().expect("consumer");

        ring.reserve(false).expect("first").publish();
        ring.reserve(false).expect("second").publish();

        let before = ring.stats();
        let err = ring.reserve(false).err().expect("third must be refused");
        assert!(matches!(err, InterceptError::RingFull));
        let after = ring.stats();
        assert_eq!(before.reserved, after.reserved);
        assert_eq!(before.handles_created, after.handles_created);
        assert_eq!(after.full_rejections, 1);
        assert_eq!(driver.live(), 2);

        consumer.peek(false).expect("head ready").retire();
        ring.reserve(false).expect("capacity freed").publish();
        assert_eq!(ring.occupancy(), 2);
    }

    #[test]
    fn unpublished_head_is_invisible() {
        let (_driver, ring) = ring(4);
        let mut consumer = ring.consumer().expect("consumer");

        let slot = ring.reserve(false).expect("reserve");
        assert_eq!(ring.occupancy(), 1);
        assert!(consumer.peek(false).is_none());
        slot.publish();
        assert!(consumer.peek(false).is_some());
    }

    #[test]
    fn later_publish_does_not_overtake_unpublished_head() {
        let (_driver, ring) = ring(4);
        let mut consumer = ring.consumer().expect("consumer");

        let first = ring.reserve(false).expect("first");
        let mut second = ring.reserve(false).expect("second");
        second.set_record(2);
        second.publish();
        assert!(consumer.peek(false).is_none());

        drop(first);
        let head = consumer.peek(false).expect("abandoned head is published");
        assert_eq!(*head.record(), 0);
        head.retire();
        assert_eq!(consumer.peek(false).expect("second").retire(), 2);
    }

    #[test]
    fn only_one_consumer_at_a_time() {
        let (_driver, ring) = ring(2);
        let consumer = ring.consumer().expect("first consumer");
        assert!(ring.consumer().is_none());
        drop(consumer);
        assert!(ring.consumer().is_some());
    }

    #[test]
    fn create_failure_publishes_an_empty_slot() {
        let (driver, ring) = ring(2);
        let mut consumer = ring.consumer().expect("consumer");
        driver.fail_create.store(true, Ordering::Relaxed);
        assert!(ring.reserve(false).is_err());
        driver.fail_create.store(false, Ordering::Relaxed);

        let head = consumer.peek(false).expect("empty slot is visible");
        assert!(head.handle().is_none());
        assert!(head.is_complete().expect("query"));
        head.retire();
        assert!(ring.is_empty());
        assert_eq!(ring.stats().handles_created, 0);
    }

    #[test]
    fn completion_query_follows_the_driver() {
        let (driver, ring) = ring(4);
        let mut consumer = ring.consumer().expect("consumer");
        ring.reserve(false).expect("reserve").publish();

        assert!(!consumer.peek(false).expect("ready").is_complete().expect("query"));
        driver.completed_below.store(1, Ordering::Release);
        assert!(consumer.peek(false).expect("ready").is_complete().expect("query"));
    }

    #[test]
    fn drain_waits_for_outstanding_and_destroys_handles() {
        let (driver, ring) = ring(4);
        let mut consumer = ring.consumer().expect("consumer");
        for value in [10u64, 20] {
            let mut slot = ring.reserve(false).expect("reserve");
            slot.set_record(value);
            slot.publish();
        }

        let mut seen = Vec::new();
        let drained = consumer.drain_on_shutdown(|record| seen.push(*record));
        assert_eq!(drained, 2);
        assert_eq!(seen, vec![10, 20]);
        assert_eq!(driver.synchronized.load(Ordering::Relaxed), 2);
        assert_eq!(driver.live(), 0);
        let stats = ring.stats();
        assert_eq!(stats.handles_created, stats.handles_destroyed);
        assert!(ring.is_empty());
    }

    #[test]
    fn dropping_the_ring_destroys_leftover_handles() {
        let (driver, ring) = ring(4);
        ring.reserve(false).expect("reserve").publish();
        ring.reserve(false).expect("reserve").publish();
        assert_eq!(driver.live(), 2);
        drop(ring);
        assert_eq!(driver.live(), 0);
    }

    #[test]
    fn concurrent_producers_retire_in_ticket_order_without_leaks() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 500;
        let (driver, ring) = ring(8);
        driver.completed_below.store(u64::MAX, Ordering::Release);
        let mut consumer = ring.consumer().expect("consumer");

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut slot = ring.reserve(true).expect("blocking reserve");
                        slot.set_record(p * PER_PRODUCER + i + 1);
                        slot.publish();
                        assert!(ring.occupancy() <= ring.capacity() as u64);
                    }
                })
            })
            .collect();

        let mut retired = 0u64;
        let mut last_ticket = None;
        let mut per_producer_last = vec![0u64; PRODUCERS as usize];
        while retired < PRODUCERS * PER_PRODUCER {
            let slot = consumer.peek(true).expect("blocking peek");
            let ticket = slot.ticket();
            if let Some(prev) = last_ticket {
                assert_eq!(ticket, prev + 1, "retirement must follow reservation order");
            }
            last_ticket = Some(ticket);
            assert!(slot.is_complete().expect("query"));
            let value = slot.retire();
            let producer = ((value - 1) / PER_PRODUCER) as usize;
            assert!(value > per_producer_last[producer], "per-producer FIFO");
            per_producer_last[producer] = value;
            retired += 1;
            let stats = ring.stats();
            assert!(stats.retired <= stats.reserved);
        }

        for handle in producers {
            handle.join().expect("producer thread");
        }
        let stats = ring.stats();
        assert_eq!(stats.reserved, PRODUCERS * PER_PRODUCER);
        assert_eq!(stats.retired, PRODUCERS * PER_PRODUCER);
        assert_eq!(stats.handles_created, stats.handles_destroyed);
        assert_eq!(driver.live(), 0);
    }
}
