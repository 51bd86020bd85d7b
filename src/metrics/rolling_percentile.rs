//! Rolling latency percentiles over a bucketed time window
//!
//! Buckets follow the same rotation discipline as the rolling counter but
//! hold capped sample vectors: once a bucket is full further samples are
//! silently dropped, bounding memory. Percentiles merge every live bucket's
//! samples, sort, and pick by nearest rank.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;

/// Circular array of time buckets holding sampled latency values (millis)
pub struct RollingPercentile {
    clock: Arc<dyn Clock>,
    bucket_size_ms: u64,
    bucket_capacity: usize,
    enabled: bool,
    buckets: Box<[SampleBucket]>,
    newest_slot: AtomicU64,
    roll: Mutex<()>,
}

struct SampleBucket {
    samples: RwLock<Vec<u64>>,
}

impl SampleBucket {
    fn new(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(Vec::with_capacity(capacity)),
        }
    }
}

impl RollingPercentile {
    /// Create a percentile tracker spanning `window` split into `bucket_count` buckets
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        window: Duration,
        bucket_count: usize,
        bucket_capacity: usize,
        enabled: bool,
    ) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_size_ms = ((window.as_millis() as u64) / bucket_count as u64).max(1);
        let newest_slot = clock.now_millis() / bucket_size_ms;
        Self {
            clock,
            bucket_size_ms,
            bucket_capacity,
            enabled,
            buckets: (0..bucket_count)
                .map(|_| SampleBucket::new(bucket_capacity))
                .collect(),
            newest_slot: AtomicU64::new(newest_slot),
            roll: Mutex::new(()),
        }
    }

    /// Record a latency sample in the current bucket
    ///
    /// A no-op when percentile tracking is disabled or the bucket is full.
    pub fn add_value(&self, value_ms: u64) {
        if !self.enabled {
            return;
        }
        let bucket = self.current_bucket();
        let mut samples = bucket.samples.write();
        if samples.len() < self.bucket_capacity {
            samples.push(value_ms);
        }
    }

    /// The latency value at percentile `p` (0.0–100.0) over the window
    ///
    /// Returns `None` when disabled or no samples are retained.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let mut samples = self.snapshot()?;
        samples.sort_unstable();

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * (samples.len() - 1) as f64).round() as usize;
        Some(samples[rank.min(samples.len() - 1)])
    }

    /// Mean latency over the window; `None` when disabled or empty
    pub fn mean(&self) -> Option<u64> {
        let samples = self.snapshot()?;
        let sum: u64 = samples.iter().sum();
        Some(sum / samples.len() as u64)
    }

    /// Number of samples currently retained in the window
    pub fn sample_count(&self) -> usize {
        self.rotate();
        self.buckets.iter().map(|b| b.samples.read().len()).sum()
    }

    /// Drop every retained sample
    pub fn reset(&self) {
        let _guard = self.roll.lock();
        for bucket in &self.buckets {
            bucket.samples.write().clear();
        }
    }

    /// Merge all live buckets' samples; `None` when disabled or empty
    fn snapshot(&self) -> Option<Vec<u64>> {
        if !self.enabled {
            return None;
        }
        self.rotate();
        let mut merged = Vec::new();
        for bucket in &self.buckets {
            merged.extend_from_slice(&bucket.samples.read());
        }
        if merged.is_empty() { None } else { Some(merged) }
    }

    fn rotate(&self) {
        let _ = self.current_bucket();
    }

    fn current_bucket(&self) -> &SampleBucket {
        let slot = self.clock.now_millis() / self.bucket_size_ms;
        let newest = self.newest_slot.load(Ordering::Acquire);
        if slot == newest {
            return self.bucket_at(slot);
        }
        if slot < newest {
            return self.bucket_at(newest);
        }
        self.roll_forward(slot)
    }

    fn roll_forward(&self, slot: u64) -> &SampleBucket {
        {
            let _guard = self.roll.lock();
            let newest = self.newest_slot.load(Ordering::Acquire);
            if slot > newest {
                let len = self.buckets.len() as u64;
                let first_stale = if slot - newest >= len {
                    slot - len + 1
                } else {
                    newest + 1
                };
                for stale in first_stale..=slot {
                    self.bucket_at(stale).samples.write().clear();
                }
                self.newest_slot.store(slot, Ordering::Release);
            }
        }
        self.bucket_at(self.newest_slot.load(Ordering::Acquire))
    }

    fn bucket_at(&self, slot: u64) -> &SampleBucket {
        let index = (slot % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }
}
