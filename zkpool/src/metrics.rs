// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A point-in-time view of pool activity. Counters are local to this
/// participant; the object counts are read from the coordinator and so
/// describe the pool as a whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolMetrics {
    /// Objects handed out by `borrow`
    pub borrowed: usize,
    /// Objects given back with `return_object`
    pub returned: usize,
    /// Successful invalidations
    pub invalidated: usize,
    /// Objects created by this participant
    pub created: usize,
    /// Objects destroyed by this participant
    pub destroyed: usize,
    /// Unused objects won on the first or a later attempt
    pub hits: usize,
    /// Unused objects lost to another borrower
    pub misses: usize,
    /// Objects this participant parked in the zombie set
    pub zombies_marked: usize,
    /// Idle objects destroyed by eviction sweeps
    pub evicted: usize,
    /// Orphaned objects put back in the unused set after a crash
    pub restored: usize,
    /// Zombies returned to the unused set
    pub zombies_revived: usize,
    /// Zombies dropped from the pool
    pub zombies_dropped: usize,
    pub size: usize,
    pub unused: usize,
    pub used: usize,
    pub zombies: usize,
    pub participants: usize,
    /// `used` over the configured capacity
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        let mut put = |k: &str, v: usize| {
            metrics.insert(k.to_string(), v.to_string());
        };
        put("borrowed", self.borrowed);
        put("returned", self.returned);
        put("invalidated", self.invalidated);
        put("created", self.created);
        put("destroyed", self.destroyed);
        put("hits", self.hits);
        put("misses", self.misses);
        put("zombies_marked", self.zombies_marked);
        put("evicted", self.evicted);
        put("restored", self.restored);
        put("zombies_revived", self.zombies_revived);
        put("zombies_dropped", self.zombies_dropped);
        put("size", self.size);
        put("unused", self.unused);
        put("used", self.used);
        put("zombies", self.zombies);
        put("participants", self.participants);
        metrics.insert(
            "utilization".to_string(),
            format!("{:.2}", self.utilization),
        );
        metrics
    }
}

/// The object counts read from the coordinator for a metrics snapshot.
#[derive(Copy, Clone, Debug, Default)]
pub struct PoolCounts {
    pub size: usize,
    pub unused: usize,
    pub used: usize,
    pub zombies: usize,
    pub participants: usize,
}

// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub borrowed: AtomicUsize,
    pub returned: AtomicUsize,
    pub invalidated: AtomicUsize,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
    pub zombies_marked: AtomicUsize,
    pub evicted: AtomicUsize,
    pub restored: AtomicUsize,
    pub zombies_revived: AtomicUsize,
    pub zombies_dropped: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_hit_or_miss(&self, hit: bool) {
        if hit {
            Self::incr(&self.hits);
        } else {
            Self::incr(&self.misses);
        }
    }

    pub fn get_metrics(&self, counts: PoolCounts, capacity: usize) -> PoolMetrics {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        let utilization = if capacity > 0 {
            counts.used as f64 / capacity as f64
        } else {
            0.0
        };

        PoolMetrics {
            borrowed: load(&self.borrowed),
            returned: load(&self.returned),
            invalidated: load(&self.invalidated),
            created: load(&self.created),
            destroyed: load(&self.destroyed),
            hits: load(&self.hits),
            misses: load(&self.misses),
            zombies_marked: load(&self.zombies_marked),
            evicted: load(&self.evicted),
            restored: load(&self.restored),
            zombies_revived: load(&self.zombies_revived),
            zombies_dropped: load(&self.zombies_dropped),
            size: counts.size,
            unused: counts.unused,
            used: counts.used,
            zombies: counts.zombies,
            participants: counts.participants,
            utilization,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_and_export() {
        let tracker = MetricsTracker::new();
        MetricsTracker::incr(&tracker.borrowed);
        MetricsTracker::incr(&tracker.borrowed);
        tracker.record_hit_or_miss(true);
        tracker.record_hit_or_miss(false);
        MetricsTracker::add(&tracker.evicted, 3);

        let counts = PoolCounts {
            size: 4,
            unused: 2,
            used: 2,
            zombies: 0,
            participants: 1,
        };
        let metrics = tracker.get_metrics(counts, 8);
        assert_eq!(metrics.borrowed, 2);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.evicted, 3);

        let exported = metrics.export();
        assert_eq!(exported.get("borrowed").map(String::as_str), Some("2"));
        assert_eq!(exported.get("utilization").map(String::as_str), Some("0.25"));
        assert_eq!(exported.get("participants").map(String::as_str), Some("1"));
    }
}
