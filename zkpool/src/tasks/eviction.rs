// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use chrono::Utc;
use slog::{debug, error, info, Logger};

use crate::error::Result;
use crate::factory::ObjectFactory;
use crate::metrics::MetricsTracker;
use crate::object_pool::{Claim, PoolInner};
use crate::paths::ObjectId;
use crate::tasks::PeriodicTask;

/// The eviction supervisor, if the pool has an eviction interval.
pub fn task<F>(pool: Arc<PoolInner<F>>) -> Option<PeriodicTask>
where
    F: ObjectFactory,
{
    let period = pool.config.evict_period()?;
    let log = pool.log.clone();
    Some(PeriodicTask::new("eviction", period, &log, move || {
        if !pool.is_running() {
            return;
        }
        match evict(&pool) {
            Ok(n) => info!(pool.log, "evicted {} objects", n),
            Err(e) => error!(pool.log, "eviction failed: {}", e),
        }
    }))
}

/// Destroy unused objects that have sat idle for at least the configured
/// maximum. At most `num_tests_per_eviction` of the longest idle objects are
/// inspected per sweep. Returns the number of objects evicted.
pub fn evict<F>(pool: &PoolInner<F>) -> Result<usize>
where
    F: ObjectFactory,
{
    pool.zk.do_synchronized(pool.paths.eviction_lock(), || {
        let mut candidates = pool.zk.children_with_stats(pool.paths.unused())?;
        candidates.sort_by_key(|(_, stat)| stat.mtime);

        let now = Utc::now().timestamp_millis();
        let unit = pool.config.interval_unit;
        let mut evicted = 0;
        for (child, stat) in
            candidates.into_iter().take(pool.config.num_tests_per_eviction)
        {
            let idle = unit.from_millis(now - stat.mtime);
            if idle < pool.config.max_idle_interval {
                continue;
            }
            let id = ObjectId::from(child);
            if evict_one(pool, &id, idle, &pool.log) {
                evicted += 1;
            }
        }
        MetricsTracker::add(&pool.metrics.evicted, evicted);
        Ok(evicted)
    })
}

fn evict_one<F>(pool: &PoolInner<F>, id: &ObjectId, idle: u64, log: &Logger) -> bool
where
    F: ObjectFactory,
{
    match pool.claim(id) {
        Claim::Borrowed(obj) => {
            debug!(log, "evicting object {}", id; "idle" => idle);
            pool.invalidate(obj)
        }
        Claim::Removed => {
            debug!(log, "idle object {} was unusable and is gone", id;
                "idle" => idle);
            true
        }
        // Borrowed by someone else since the listing.
        Claim::Unavailable => false,
    }
}
