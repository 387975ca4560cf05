// Copyright 2020 Joyent, Inc.

//
// Zombies are objects whose state the factory could not determine. Each
// sweep gives them another validation: those that pass go back to unused,
// those that fail are destroyed and removed from the pool. An object that
// is still a zombie ends the sweep; the next one will try again.
//

use std::sync::Arc;

use slog::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::factory::{FactoryError, ObjectFactory};
use crate::metrics::MetricsTracker;
use crate::object_pool::PoolInner;
use crate::paths::ObjectId;
use crate::tasks::PeriodicTask;

/// The zombie reconciler, unless zombie detection is disabled.
pub fn task<F>(pool: Arc<PoolInner<F>>) -> Option<PeriodicTask>
where
    F: ObjectFactory,
{
    let period = pool.config.zombie_detection_period()?;
    let log = pool.log.clone();
    Some(PeriodicTask::new("zombie reconciler", period, &log, move || {
        if !pool.is_running() {
            return;
        }
        match reconcile(&pool) {
            Ok(0) => (),
            Ok(n) => info!(pool.log, "reconciled {} zombies", n),
            Err(e) => error!(pool.log, "zombie reconciliation failed: {}", e),
        }
    }))
}

enum Verdict {
    Revive,
    Drop,
    StillZombie,
    Undecided,
}

/// Settle the fate of every zombie. Returns the number of zombies revived
/// or dropped.
pub fn reconcile<F>(pool: &PoolInner<F>) -> Result<usize>
where
    F: ObjectFactory,
{
    if pool.child_count(pool.paths.zombies())? == 0 {
        return Ok(0);
    }
    pool.zk.do_synchronized(pool.paths.zombies_lock(), || {
        let mut settled = 0;
        for id in pool.zombie_ids()? {
            let verdict = match judge(pool, &id) {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(pool.log, "unable to check zombie {}: {}", id, e);
                    continue;
                }
            };
            let result = match verdict {
                Verdict::Revive => pool.unzombie(&id).map(|done| {
                    if done {
                        debug!(pool.log, "revived zombie {}", id);
                        MetricsTracker::incr(&pool.metrics.zombies_revived);
                    }
                    done
                }),
                Verdict::Drop => pool.drop_zombie(&id).map(|done| {
                    if done {
                        debug!(pool.log, "dropped zombie {}", id);
                        MetricsTracker::incr(&pool.metrics.zombies_dropped);
                    }
                    done
                }),
                Verdict::StillZombie => {
                    debug!(pool.log, "object {} is still a zombie", id);
                    break;
                }
                Verdict::Undecided => continue,
            };
            match result {
                Ok(true) => settled += 1,
                Ok(false) => (),
                Err(e) => error!(pool.log, "failed to settle zombie {}: {}", id, e),
            }
        }
        Ok(settled)
    })
}

fn judge<F>(pool: &PoolInner<F>, id: &ObjectId) -> Result<Verdict>
where
    F: ObjectFactory,
{
    let obj = match pool.load(id) {
        Ok(obj) => obj,
        Err(Error::Factory(e)) => {
            warn!(pool.log, "unable to load zombie {}: {}", id, e);
            return Ok(Verdict::Drop);
        }
        // The master record is gone; only the zombie marker is left.
        Err(ref e) if e.is_no_node() => return Ok(Verdict::Drop),
        Err(e) => return Err(e),
    };

    let factory = pool.factory();
    match factory.validate(&obj) {
        Ok(true) => Ok(Verdict::Revive),
        Err(FactoryError::Zombie(_)) => Ok(Verdict::StillZombie),
        Err(e) => {
            warn!(pool.log, "error validating zombie {}: {}", id, e);
            Ok(Verdict::Undecided)
        }
        Ok(false) => {
            match factory.destroy(obj) {
                Ok(()) => {
                    MetricsTracker::incr(&pool.metrics.destroyed);
                    Ok(Verdict::Drop)
                }
                Err(FactoryError::Zombie(_)) => Ok(Verdict::StillZombie),
                Err(e) => {
                    warn!(pool.log, "error destroying zombie {}: {}", id, e);
                    Ok(Verdict::Drop)
                }
            }
        }
    }
}
