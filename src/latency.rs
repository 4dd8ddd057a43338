//! Lock-free ring of recent task latencies.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Fixed-capacity circular buffer of nanosecond samples.
///
/// Writers race readers by design: slots are plain atomics and a reader may
/// observe a mix of old and new samples. The average is an estimate, which is
/// all the worker-pool sizing needs.
#[derive(Debug)]
pub struct LatencyRing {
    slots: Box<[AtomicI64]>,
    index: AtomicU64,
    added: AtomicU64,
}

impl LatencyRing {
    /// Create a ring with the given number of slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "latency ring capacity must be positive");
        Self {
            slots: (0..capacity).map(|_| AtomicI64::new(0)).collect(),
            index: AtomicU64::new(0),
            added: AtomicU64::new(0),
        }
    }

    /// Record one sample, overwriting the oldest slot once full.
    pub fn add(&self, nanos: i64) {
        let index = self.index.fetch_add(1, Ordering::Relaxed) as usize % self.slots.len();
        // An even newer value may already sit in this slot; overwriting it
        // with a slightly older one is acceptable for an estimate.
        self.slots[index].store(nanos, Ordering::Relaxed);
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    /// Arithmetic mean over the occupied slots, in nanoseconds.
    /// Returns 0.0 when nothing has been recorded.
    pub fn average(&self) -> f64 {
        let added = self.added.load(Ordering::Relaxed) as usize;
        let occupied = added.min(self.slots.len());
        if occupied == 0 {
            return 0.0;
        }

        let total: i64 = self.slots[..occupied]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum();
        total as f64 / occupied as f64
    }

    /// Arithmetic mean over the occupied slots, in seconds.
    pub fn average_secs(&self) -> f64 {
        self.average() / 1e9
    }
}
