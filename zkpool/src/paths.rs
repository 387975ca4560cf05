// Copyright 2020 Joyent, Inc.

use std::cmp::Ordering;

use derive_more::{Display, From, Into};

/// The identity of a pooled object: the sequence suffix assigned when its
/// `master` node was created.
#[derive(Clone, Debug, Display, Eq, From, Hash, Into, PartialEq)]
pub struct ObjectId(String);

impl ObjectId {
    /// Derive the id from a node path by taking its final segment.
    pub fn from_path(path: &str) -> Self {
        let id = path.rsplit('/').next().unwrap_or(path);
        ObjectId(String::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric value of the id, if it has one.
    pub fn seq(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        ObjectId(String::from(s))
    }
}

// Numeric ids order numerically; anything else sorts after them by text.
impl Ord for ObjectId {
    fn cmp(&self, other: &ObjectId) -> Ordering {
        match (self.seq(), other.seq()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &ObjectId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The coordinator paths that make up the durable state of one pool. All of
/// them are derived from the pool name when the pool is constructed.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolPaths {
    base: String,
    master: String,
    unused: String,
    used: String,
    zombies: String,
    participants: String,
    shutdown_lock: String,
    crash_cleanup_lock: String,
    eviction_lock: String,
    zombies_lock: String,
}

impl PoolPaths {
    pub fn new(name: &str) -> Self {
        let base = format!("/{}", name);
        let child = |c: &str| format!("{}/{}", base, c);
        PoolPaths {
            master: child("master"),
            unused: child("unused"),
            used: child("used"),
            zombies: child("zombies"),
            participants: child("participants"),
            shutdown_lock: child("shutdown-lock"),
            crash_cleanup_lock: child("crash-cleanup-lock"),
            eviction_lock: child("eviction-lock"),
            zombies_lock: child("zombies-lock"),
            base,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn unused(&self) -> &str {
        &self.unused
    }

    pub fn used(&self) -> &str {
        &self.used
    }

    pub fn zombies(&self) -> &str {
        &self.zombies
    }

    pub fn participants(&self) -> &str {
        &self.participants
    }

    pub fn shutdown_lock(&self) -> &str {
        &self.shutdown_lock
    }

    pub fn crash_cleanup_lock(&self) -> &str {
        &self.crash_cleanup_lock
    }

    pub fn eviction_lock(&self) -> &str {
        &self.eviction_lock
    }

    pub fn zombies_lock(&self) -> &str {
        &self.zombies_lock
    }

    /// Every path of the schema, parents before children, suitable for a
    /// bootstrap transaction.
    pub fn all(&self) -> Vec<&str> {
        vec![
            &self.base,
            &self.master,
            &self.unused,
            &self.used,
            &self.zombies,
            &self.participants,
            &self.shutdown_lock,
            &self.crash_cleanup_lock,
            &self.eviction_lock,
            &self.zombies_lock,
        ]
    }

    pub fn master_node(&self, id: &ObjectId) -> String {
        node(&self.master, id)
    }

    pub fn unused_node(&self, id: &ObjectId) -> String {
        node(&self.unused, id)
    }

    pub fn used_node(&self, id: &ObjectId) -> String {
        node(&self.used, id)
    }

    pub fn zombie_node(&self, id: &ObjectId) -> String {
        node(&self.zombies, id)
    }

    pub fn participant_node(&self, id: &str) -> String {
        format!("{}/{}", self.participants, id)
    }

    /// Prefix for sequential creates under `master`.
    pub fn master_prefix(&self) -> String {
        format!("{}/", self.master)
    }

    /// Prefix for sequential creates under `participants`.
    pub fn participant_prefix(&self) -> String {
        format!("{}/", self.participants)
    }
}

fn node(parent: &str, id: &ObjectId) -> String {
    format!("{}/{}", parent, id)
}
