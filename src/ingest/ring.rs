use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::core::types::DeltaBatch;

/// Single-producer single-consumer ring buffer of delta batches.
///
/// Capacity is a power of two; the producer and consumer cursors live on
/// their own cache lines. Slots are preallocated batch records and moved
/// in and out by swap, so steady-state operation does not allocate.
///
/// Memory ordering contract: a slot's contents are written before the
/// producer cursor is published (Release), and the consumer observes the
/// cursor with Acquire before reading the slot; cursor advances on the
/// consumer side are likewise Release so the producer's utilization read
/// sees them.
pub struct RingBuffer {
    slots: Vec<UnsafeCell<DeltaBatch>>,
    mask: u64,
    capacity: usize,
    producer: CachePadded<AtomicU64>,
    consumer: CachePadded<AtomicU64>,
    backpressured: AtomicBool,
    poisoned: AtomicBool,
    backpressure_events: AtomicU64,
    high_watermark: f64,
    low_watermark: f64,
}

// One producer context and one consumer context; the cursor protocol
// above makes the slot handoff safe.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize, slot_capacity: usize, high: f64, low: f64) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(DeltaBatch::with_capacity(slot_capacity)))
            .collect();
        RingBuffer {
            slots,
            mask: capacity as u64 - 1,
            capacity,
            producer: CachePadded::new(AtomicU64::new(0)),
            consumer: CachePadded::new(AtomicU64::new(0)),
            backpressured: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            backpressure_events: AtomicU64::new(0),
            high_watermark: high,
            low_watermark: low,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        let p = self.producer.load(Ordering::Acquire);
        let c = self.consumer.load(Ordering::Acquire);
        (p - c) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    /// Whether a producer rejected earlier for backpressure may retry.
    pub fn can_resume(&self) -> bool {
        !self.backpressured.load(Ordering::Acquire) || self.utilization() <= self.low_watermark
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Push a batch by swapping it into the next slot. Returns false when
    /// poisoned, full, or under backpressure; the caller's batch is left
    /// untouched in those cases.
    ///
    /// Backpressure is hysteretic: once utilization reaches the high
    /// watermark, produce keeps rejecting until it falls to the low one.
    pub fn produce(&self, batch: &mut DeltaBatch) -> bool {
        if self.is_poisoned() {
            return false;
        }
        let util = self.utilization();
        if self.backpressured.load(Ordering::Acquire) {
            if util <= self.low_watermark {
                self.backpressured.store(false, Ordering::Release);
            } else {
                self.backpressure_events.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        if util >= self.high_watermark {
            self.backpressured.store(true, Ordering::Release);
            self.backpressure_events.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let p = self.producer.load(Ordering::Relaxed);
        let c = self.consumer.load(Ordering::Acquire);
        if (p - c) as usize >= self.capacity {
            self.backpressure_events.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &self.slots[(p & self.mask) as usize];
        unsafe {
            std::mem::swap(&mut *slot.get(), batch);
        }
        self.producer.store(p + 1, Ordering::Release);
        true
    }

    /// Pop the next batch by swapping it into `out`. Returns false when
    /// the ring is empty. `out` is cleared first.
    pub fn consume(&self, out: &mut DeltaBatch) -> bool {
        let c = self.consumer.load(Ordering::Relaxed);
        let p = self.producer.load(Ordering::Acquire);
        if c == p {
            return false;
        }
        out.clear();
        let slot = &self.slots[(c & self.mask) as usize];
        unsafe {
            std::mem::swap(&mut *slot.get(), out);
        }
        self.consumer.store(c + 1, Ordering::Release);
        true
    }

    /// Drop everything queued. Used by destroy().
    pub fn drain_discard(&self) {
        let mut scratch = DeltaBatch::new();
        while self.consume(&mut scratch) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Delta, Rid, RowId};
    use crate::core::value::Document;

    fn batch_of(n: usize) -> DeltaBatch {
        let mut batch = DeltaBatch::new();
        for i in 0..n {
            batch.push(Delta::insert(Rid::source(RowId(i as u64)), Document::new(), i as u64));
        }
        batch
    }

    #[test]
    fn test_produce_consume_round_trip() {
        let ring = RingBuffer::new(8, 16, 0.8, 0.4);
        let mut batch = batch_of(3);
        assert!(ring.produce(&mut batch));
        assert_eq!(ring.len(), 1);

        let mut out = DeltaBatch::new();
        assert!(ring.consume(&mut out));
        assert_eq!(out.len(), 3);
        assert!(!ring.consume(&mut out));
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let ring = RingBuffer::new(6, 4, 0.8, 0.4);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn test_backpressure_hysteresis() {
        let ring = RingBuffer::new(8, 4, 0.8, 0.4);
        // Fill to 6/8 = 0.75: still accepted.
        for _ in 0..6 {
            assert!(ring.produce(&mut batch_of(1)));
        }
        // 0.75 < 0.8 so this one goes in, reaching 7/8.
        assert!(ring.produce(&mut batch_of(1)));
        // Utilization now 0.875 >= 0.8: rejected and latched.
        assert!(!ring.produce(&mut batch_of(1)));
        assert!(ring.backpressure_events() > 0);

        // Draining to 0.5 is not enough; must fall to <= 0.4.
        let mut out = DeltaBatch::new();
        for _ in 0..3 {
            ring.consume(&mut out);
        }
        assert_eq!(ring.utilization(), 0.5);
        assert!(!ring.produce(&mut batch_of(1)));

        ring.consume(&mut out);
        assert_eq!(ring.utilization(), 0.375);
        assert!(ring.can_resume());
        assert!(ring.produce(&mut batch_of(1)));
    }

    #[test]
    fn test_poison_rejects_producers() {
        let ring = RingBuffer::new(8, 4, 0.8, 0.4);
        ring.poison();
        assert!(!ring.produce(&mut batch_of(1)));
    }

    #[test]
    fn test_drain_discard() {
        let ring = RingBuffer::new(8, 4, 0.8, 0.4);
        for _ in 0..4 {
            ring.produce(&mut batch_of(2));
        }
        ring.drain_discard();
        assert!(ring.is_empty());
    }
}
