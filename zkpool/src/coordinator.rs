// Copyright 2020 Joyent, Inc.

//! The raw coordinator client contract.
//!
//! The pool talks to its coordination service through the
//! [`Session`](trait.Session.html) and [`Connector`](trait.Connector.html)
//! traits. They mirror the primitives of a ZooKeeper client: hierarchical
//! nodes with persistent, ephemeral and sequential flavours, one-shot
//! watches, and atomic multi-op transactions. The
//! [`zookeeper`](zookeeper/index.html) module connects to a real ZooKeeper
//! ensemble; [`memory`](memory/index.html) is a complete in-process
//! stand-in used by the tests.

pub mod memory;
pub mod zookeeper;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ZkConnectString;

/// Failures reported by the raw coordinator client.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ZkError {
    #[error("node {0} does not exist")]
    NoNode(String),
    #[error("node {0} already exists")]
    NodeExists(String),
    #[error("node {0} has children")]
    NotEmpty(String),
    #[error("ephemeral node {0} may not have children")]
    NoChildrenForEphemerals(String),
    #[error("connection to the coordinator was lost")]
    ConnectionLoss,
    #[error("coordinator session expired")]
    SessionExpired,
    #[error("bad arguments: {0}")]
    BadArguments(String),
}

impl ZkError {
    /// True for failures that a reconnect may cure.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ZkError::ConnectionLoss | ZkError::SessionExpired)
    }
}

pub type ZkResult<T> = Result<T, ZkError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata. Times are milliseconds since the unix epoch.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Stat {
    pub czxid: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: u32,
    pub num_children: usize,
    pub ephemeral_owner: Option<SessionId>,
}

pub type SessionId = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    Expired,
    Closed,
}

impl fmt::Display for KeeperState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeeperState::Disconnected => "disconnected".fmt(fmt),
            KeeperState::SyncConnected => "connected".fmt(fmt),
            KeeperState::Expired => "expired".fmt(fmt),
            KeeperState::Closed => "closed".fmt(fmt),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchedEvent {
    pub event_type: WatchedEventType,
    pub keeper_state: KeeperState,
    /// The node the event concerns; `None` for session state changes.
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn session(keeper_state: KeeperState) -> Self {
        WatchedEvent {
            event_type: WatchedEventType::None,
            keeper_state,
            path: None,
        }
    }
}

/// A one-shot node watch.
pub type Watcher = Box<dyn FnOnce(WatchedEvent) + Send>;

/// Receives every session state change for the lifetime of a session.
pub type SessionWatcher = Arc<dyn Fn(WatchedEvent) + Send + Sync>;

/// A single write inside a multi-op transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
    },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. } | Op::Delete { path } => path,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OpResult {
    /// The path actually created, including any sequence suffix.
    Created(String),
    Deleted,
}

/// One live connection to the coordinator. Implementations must be safe to
/// share between threads.
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn state(&self) -> KeeperState;

    /// Create a node, returning the created path. Sequential modes append a
    /// zero-padded ten digit counter to `path`.
    fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> ZkResult<String>;

    /// Delete a childless node.
    fn delete(&self, path: &str) -> ZkResult<()>;

    /// Stat a node. The watcher, if any, is left set whether or not the node
    /// exists and fires on its creation, deletion or data change.
    fn exists(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> ZkResult<Option<Stat>>;

    /// List child names. The watcher, if any, fires on the next change to
    /// the child list or on deletion of the node.
    fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> ZkResult<Vec<String>>;

    fn get_data(&self, path: &str) -> ZkResult<(Vec<u8>, Stat)>;

    /// Apply every op or none of them.
    fn multi(&self, ops: &[Op]) -> ZkResult<Vec<OpResult>>;

    /// Wait until this session's view is up to date with the leader.
    fn sync(&self, path: &str) -> ZkResult<()>;

    fn close(&self);
}

/// Establishes sessions with a coordinator ensemble.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        connect_string: &ZkConnectString,
        session_timeout: Duration,
        watcher: SessionWatcher,
    ) -> ZkResult<Arc<dyn Session>>;
}
