use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

/// A single token bucket. `level` is how much has been added and not yet
/// drained; it decays at the collector's steady rate.
struct Bucket {
    level: f64,
    updated: Instant,
}

impl Bucket {
    fn drained(&self, rate: f64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        (self.level - rate * elapsed).max(0.0)
    }
}

/// Keyed collection of token buckets sharing one steady rate and burst
/// capacity. Buckets are never deleted on their own; the collector is
/// dropped together with its owner.
pub struct Collector {
    rate: f64,
    capacity: i64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Collector {
    /// `rate` is the drain in units per second, `capacity` the burst ceiling.
    pub fn new(rate: f64, capacity: i64) -> Self {
        Collector {
            rate,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Headroom left before the bucket for `key` hits capacity.
    pub fn remaining(&self, key: &str) -> i64 {
        let buckets = self.buckets.lock().unwrap();
        let level = buckets
            .get(key)
            .map(|bucket| bucket.drained(self.rate, Instant::now()))
            .unwrap_or(0.0);
        (self.capacity as f64 - level) as i64
    }

    /// Adds `amount` to the bucket, clamped at capacity. Returns the amount
    /// actually added.
    pub fn add(&self, key: &str, amount: i64) -> i64 {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            level: 0.0,
            updated: now,
        });
        bucket.level = bucket.drained(self.rate, now);
        bucket.updated = now;
        let added = (amount as f64)
            .min(self.capacity as f64 - bucket.level)
            .max(0.0);
        bucket.level += added;
        added as i64
    }

    /// Time until the bucket for `key` is fully drained.
    pub fn till_empty(&self, key: &str) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let buckets = self.buckets.lock().unwrap();
        let level = buckets
            .get(key)
            .map(|bucket| bucket.drained(self.rate, Instant::now()))
            .unwrap_or(0.0);
        Duration::from_secs_f64(level / self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn debits_and_reports_headroom() {
        let collector = Collector::new(64.0, 64);
        assert_eq!(collector.remaining("peer1"), 64);

        assert_eq!(collector.add("peer1", 24), 24);
        assert_eq!(collector.remaining("peer1"), 40);
        // Other keys are unaffected.
        assert_eq!(collector.remaining("peer2"), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn add_is_clamped_at_capacity() {
        let collector = Collector::new(64.0, 64);
        assert_eq!(collector.add("peer1", 100), 64);
        assert_eq!(collector.remaining("peer1"), 0);
        assert_eq!(collector.add("peer1", 1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_time_based() {
        let collector = Collector::new(64.0, 128);
        collector.add("peer1", 128);
        assert_eq!(collector.remaining("peer1"), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(collector.remaining("peer1"), 64);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(collector.remaining("peer1"), 128);
    }

    #[tokio::test(start_paused = true)]
    async fn till_empty_tracks_level() {
        let collector = Collector::new(64.0, 128);
        assert_eq!(collector.till_empty("peer1"), Duration::ZERO);

        collector.add("peer1", 64);
        assert_eq!(collector.till_empty("peer1"), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(collector.till_empty("peer1"), Duration::from_millis(500));
    }
}
