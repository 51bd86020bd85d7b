//! Rolling event counter over a bucketed time window
//!
//! Time is divided into N equal buckets spanning the window. Steady-state
//! increments are lock-free atomics on the current bucket; only the
//! roll-forward transition takes a lock, and it runs exactly once per new
//! time slot. Values rotated out of the window are absorbed into a monotonic
//! cumulative accumulator before their bucket is cleared.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::events::EventType;

/// Circular array of time buckets counting events per [`EventType`]
pub struct RollingNumber {
    clock: Arc<dyn Clock>,
    bucket_size_ms: u64,
    buckets: Box<[Bucket]>,
    /// Absolute slot index (`now / bucket width`) of the newest live bucket
    newest_slot: AtomicU64,
    /// Guards the roll-forward transition; increments never take it
    roll: Mutex<()>,
    /// All-time totals of values that rotated out of the window
    cumulative: [AtomicU64; EventType::COUNT],
}

struct Bucket {
    counts: [AtomicU64; EventType::COUNT],
    /// Watermark for gauge-style metrics (max concurrent executions)
    max_value: AtomicU64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            max_value: AtomicU64::new(0),
        }
    }

    /// Absorb this bucket's counts into the cumulative totals and clear it
    fn drain_into(&self, cumulative: &[AtomicU64; EventType::COUNT]) {
        for (total, count) in cumulative.iter().zip(&self.counts) {
            let value = count.swap(0, Ordering::AcqRel);
            if value > 0 {
                total.fetch_add(value, Ordering::AcqRel);
            }
        }
        self.max_value.store(0, Ordering::Release);
    }
}

impl RollingNumber {
    /// Create a counter spanning `window` split into `bucket_count` buckets
    ///
    /// The window must divide evenly into the bucket count; configuration
    /// validation enforces this before construction.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, window: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_size_ms = ((window.as_millis() as u64) / bucket_count as u64).max(1);
        let newest_slot = clock.now_millis() / bucket_size_ms;
        Self {
            clock,
            bucket_size_ms,
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            newest_slot: AtomicU64::new(newest_slot),
            roll: Mutex::new(()),
            cumulative: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one occurrence of an event in the current bucket
    pub fn increment(&self, event: EventType) {
        self.add(event, 1);
    }

    /// Record `value` occurrences of an event in the current bucket
    pub fn add(&self, event: EventType, value: u64) {
        self.current_bucket().counts[event.index()].fetch_add(value, Ordering::AcqRel);
    }

    /// Raise the current bucket's watermark to at least `value`
    pub fn update_max(&self, value: u64) {
        self.current_bucket().max_value.fetch_max(value, Ordering::AcqRel);
    }

    /// Sum of an event over all buckets currently inside the window
    pub fn rolling_sum(&self, event: EventType) -> u64 {
        self.rotate();
        self.buckets
            .iter()
            .map(|b| b.counts[event.index()].load(Ordering::Acquire))
            .sum()
    }

    /// All-time total of an event, unaffected by rotation
    pub fn cumulative_sum(&self, event: EventType) -> u64 {
        self.rotate();
        self.cumulative[event.index()].load(Ordering::Acquire) + self.rolling_sum(event)
    }

    /// Highest watermark recorded inside the window
    pub fn rolling_max(&self) -> u64 {
        self.rotate();
        self.buckets
            .iter()
            .map(|b| b.max_value.load(Ordering::Acquire))
            .max()
            .unwrap_or(0)
    }

    /// Clear the window, absorbing live counts into the cumulative totals
    pub fn reset(&self) {
        let _guard = self.roll.lock();
        for bucket in &self.buckets {
            bucket.drain_into(&self.cumulative);
        }
    }

    /// Advance bucket rotation to the current time without recording anything
    fn rotate(&self) {
        let _ = self.current_bucket();
    }

    fn current_bucket(&self) -> &Bucket {
        let slot = self.clock.now_millis() / self.bucket_size_ms;
        let newest = self.newest_slot.load(Ordering::Acquire);
        if slot == newest {
            return self.bucket_at(slot);
        }
        if slot < newest {
            // Clock went backwards; keep writing to the newest bucket
            return self.bucket_at(newest);
        }
        self.roll_forward(slot)
    }

    /// Advance the window to `slot`, clearing every bucket time passed through
    fn roll_forward(&self, slot: u64) -> &Bucket {
        {
            let _guard = self.roll.lock();
            let newest = self.newest_slot.load(Ordering::Acquire);
            if slot > newest {
                let len = self.buckets.len() as u64;
                // A gap longer than the whole window touches each bucket once
                let first_stale = if slot - newest >= len {
                    slot - len + 1
                } else {
                    newest + 1
                };
                for stale in first_stale..=slot {
                    self.bucket_at(stale).drain_into(&self.cumulative);
                }
                self.newest_slot.store(slot, Ordering::Release);
            }
        }
        self.bucket_at(self.newest_slot.load(Ordering::Acquire))
    }

    fn bucket_at(&self, slot: u64) -> &Bucket {
        let index = (slot % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }
}
