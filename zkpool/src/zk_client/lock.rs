// Copyright 2020 Joyent, Inc.

//
// Cross-participant write lock. Each contender creates an ephemeral
// sequential `lock-` child under the lock root; the holder is the contender
// with the lowest sequence number. Everyone else watches the child just
// ahead of its own and re-checks when that watch fires, or after
// LOCK_POLL_INTERVAL, whichever comes first.
//

use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Duration;

use slog::{debug, trace, warn, Logger};

use crate::error::{Error, Result};
use crate::zk_client::{join, ZkClient};

pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

const LOCK_PREFIX: &str = "lock-";

/// Holds a cross-participant lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    client: ZkClient,
    node: String,
    log: Logger,
}

impl LockGuard {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.client.delete(&self.node) {
            Ok(()) => trace!(self.log, "released lock"; "node" => &self.node),
            // Gone with an expired session, or the client is shut down and
            // the ephemeral node goes with its session.
            Err(ref e) if e.is_no_node() => (),
            Err(Error::Shutdown) => (),
            Err(e) => warn!(self.log, "failed to release lock {}: {}",
                self.node, e),
        }
    }
}

fn sequence(child: &str) -> u64 {
    child
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

impl ZkClient {
    /// Block until the lock rooted at `lock_path` is held by this
    /// participant.
    pub fn lock(&self, lock_path: &str) -> Result<LockGuard> {
        loop {
            if self.is_shutdown() {
                return Err(Error::Shutdown);
            }
            match self.try_lock(lock_path) {
                Ok(guard) => return Ok(guard),
                Err(Error::Zk(e)) if e.is_connection_error() => {
                    warn!(self.log(),
                        "lost connection while acquiring lock {}, \
                         trying again in {:?}", lock_path, LOCK_POLL_INTERVAL);
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_lock(&self, lock_path: &str) -> Result<LockGuard> {
        let node = self.create_ephemeral_sequential(
            &join(lock_path, LOCK_PREFIX),
            &[],
        )?;
        // From here on the guard cleans up our node on every exit path.
        let guard = LockGuard {
            client: self.clone(),
            node,
            log: self.log().clone(),
        };
        let own = guard
            .node
            .rsplit('/')
            .next()
            .map(String::from)
            .unwrap_or_default();

        loop {
            if self.is_shutdown() {
                return Err(Error::LockAborted(String::from(lock_path)));
            }

            let mut contenders: Vec<String> = self
                .children(lock_path)?
                .into_iter()
                .filter(|c| c.starts_with(LOCK_PREFIX))
                .collect();
            contenders.sort_by_key(|c| sequence(c));

            let predecessor = match contenders.iter().position(|c| *c == own) {
                Some(0) => {
                    debug!(self.log(), "acquired lock"; "node" => &guard.node);
                    return Ok(guard);
                }
                Some(idx) => join(lock_path, &contenders[idx - 1]),
                // Our node went away with an expired session; start over.
                None => {
                    return Err(crate::coordinator::ZkError::SessionExpired.into())
                }
            };

            let (tx, rx) = sync_channel(1);
            let present = self.exists_w(&predecessor, move |_| {
                let _ = tx.try_send(());
            })?;
            if present {
                trace!(self.log(), "waiting on lock predecessor";
                    "predecessor" => &predecessor);
                let _ = rx.recv_timeout(LOCK_POLL_INTERVAL);
            }
        }
    }

    /// Run `f` while holding the cross-participant lock rooted at
    /// `lock_path`. The lock is released however `f` exits, including by
    /// unwinding.
    pub fn do_synchronized<T, F>(&self, lock_path: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let _guard = self.lock(lock_path)?;
        f()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequence_from_child_name() {
        assert_eq!(sequence("lock-0000000042"), 42);
        assert_eq!(sequence("garbage"), u64::MAX);
    }
}
