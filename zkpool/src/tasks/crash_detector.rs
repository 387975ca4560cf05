// Copyright 2020 Joyent, Inc.

//
// Watches the participant list. When it shrinks, a participant has left,
// and any object it held under `used` has lost its ephemeral marker. Such
// orphans are found by listing master and are filed back under unused.
// Zombies are left for the zombie reconciler.
//

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use slog::{debug, error, info, o, warn, Logger};

use crate::coordinator::{WatchedEvent, WatchedEventType};
use crate::error::Result;
use crate::factory::ObjectFactory;
use crate::metrics::MetricsTracker;
use crate::object_pool::PoolInner;
use crate::paths::ObjectId;
use crate::tasks::PoolTask;

struct DetectorState {
    running: AtomicBool,
    last_known: AtomicUsize,
    log: Logger,
}

pub struct CrashDetector<F>
where
    F: ObjectFactory,
{
    pool: Arc<PoolInner<F>>,
    state: Arc<DetectorState>,
}

impl<F> CrashDetector<F>
where
    F: ObjectFactory,
{
    pub fn new(pool: Arc<PoolInner<F>>) -> Self {
        let log = pool.log.new(o!("component" => "CrashDetector"));
        CrashDetector {
            pool,
            state: Arc::new(DetectorState {
                running: AtomicBool::new(false),
                last_known: AtomicUsize::new(0),
                log,
            }),
        }
    }
}

impl<F> PoolTask for CrashDetector<F>
where
    F: ObjectFactory,
{
    fn name(&self) -> &str {
        "crash detector"
    }

    fn start(&mut self) -> Result<()> {
        self.state.running.store(true, Ordering::SeqCst);
        let count = arm(&self.pool, &self.state)?;
        self.state.last_known.store(count, Ordering::SeqCst);
        debug!(self.state.log, "watching participants"; "count" => count);

        // Watches do not survive a session; arm a new one on reconnect.
        let pool = Arc::downgrade(&self.pool);
        let state = Arc::clone(&self.state);
        self.pool.zk.on_reconnect(move || {
            if let Some(pool) = pool.upgrade() {
                info!(state.log, "session replaced, re-arming watch");
                check(&pool, &state);
            }
        });
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}

// Read the participant count and leave a watch on the list.
fn arm<F>(pool: &Arc<PoolInner<F>>, state: &Arc<DetectorState>) -> Result<usize>
where
    F: ObjectFactory,
{
    let weak = Arc::downgrade(pool);
    let watch_state = Arc::clone(state);
    pool.zk
        .children_w(pool.paths.participants(), move |event| {
            on_event(&weak, &watch_state, event)
        })
        .map(|participants| participants.len())
}

fn on_event<F>(pool: &Weak<PoolInner<F>>, state: &Arc<DetectorState>, event: WatchedEvent)
where
    F: ObjectFactory,
{
    if !state.running.load(Ordering::SeqCst) {
        return;
    }
    let pool = match pool.upgrade() {
        Some(pool) => pool,
        None => return,
    };
    if pool.zk.is_shutdown() || !pool.is_running() {
        return;
    }
    if event.path.as_deref() != Some(pool.paths.participants()) {
        return;
    }
    match event.event_type {
        WatchedEventType::None | WatchedEventType::NodeDeleted => (),
        _ => check(&pool, state),
    }
}

fn check<F>(pool: &Arc<PoolInner<F>>, state: &Arc<DetectorState>)
where
    F: ObjectFactory,
{
    if !state.running.load(Ordering::SeqCst) {
        return;
    }
    let count = match arm(pool, state) {
        Ok(count) => count,
        Err(e) => {
            warn!(state.log, "unable to watch participants: {}", e);
            return;
        }
    };
    let last_known = state.last_known.swap(count, Ordering::SeqCst);
    debug!(state.log, "participants changed";
        "was" => last_known, "now" => count);

    if count < last_known && count != 0 {
        info!(state.log, "participant left, looking for orphaned objects");
        match restore_orphans(pool) {
            Ok(0) => debug!(state.log, "no orphaned objects"),
            Ok(n) => info!(state.log, "restored {} orphaned objects", n),
            Err(e) => error!(state.log, "crash cleanup failed: {}", e),
        }
    }
}

/// File every object that is neither used, unused nor a zombie back under
/// unused. Returns the number of objects restored.
pub fn restore_orphans<F>(pool: &PoolInner<F>) -> Result<usize>
where
    F: ObjectFactory,
{
    let paths = &pool.paths;
    pool.zk.do_synchronized(paths.crash_cleanup_lock(), || {
        let mut accounted: HashSet<String> = HashSet::new();
        for set in &[paths.used(), paths.unused(), paths.zombies()] {
            accounted.extend(pool.zk.children(set)?);
        }

        let mut restored = 0;
        for child in pool.zk.children(paths.master())? {
            if accounted.contains(&child) {
                continue;
            }
            let id = ObjectId::from(child);
            // Borrowed since the listing.
            if pool.zk.exists(&paths.used_node(&id))? {
                continue;
            }
            match pool.zk.create(&paths.unused_node(&id)) {
                Ok(_) => {
                    debug!(pool.log, "restored orphaned object {}", id);
                    restored += 1;
                }
                Err(ref e) if e.is_node_exists() => (),
                // Invalidated since the listing.
                Err(ref e) if e.is_no_node() => (),
                Err(e) => return Err(e),
            }
        }
        MetricsTracker::add(&pool.metrics.restored, restored);
        Ok(restored)
    })
}
