// Copyright 2020 Joyent, Inc.

use thiserror::Error;

use crate::coordinator::{SessionId, ZkError};
use crate::factory::FactoryError;

/// The error type returned by fallible pool and coordinator adapter
/// operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool options failed validation. Fatal at `initialize`.
    #[error("invalid pool configuration: {0}")]
    Config(String),
    /// A coordinator operation failed after the adapter exhausted its
    /// retries.
    #[error("coordinator error: {0}")]
    Zk(#[from] ZkError),
    /// The object factory failed.
    #[error("object factory error: {0}")]
    Factory(#[from] FactoryError),
    /// No connected coordinator session could be established within the
    /// connect budget.
    #[error("timed out connecting to the coordinator after {0} seconds")]
    ConnectTimeout(u64),
    /// The coordinator adapter has been shut down and refuses further work.
    #[error("coordinator client is shut down")]
    Shutdown,
    /// The pool is not in a state that permits the requested operation.
    #[error("pool is {0}")]
    NotRunning(String),
    /// An operation bound to a session was refused because that session is
    /// no longer the live one. Its ephemeral nodes are gone.
    #[error("session {0:#x} has been replaced")]
    SessionReplaced(SessionId),
    /// A lock acquisition attempt was abandoned.
    #[error("gave up acquiring lock {0}")]
    LockAborted(String),
    /// A supervisor thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the coordinator error if this is one.
    pub fn zk(&self) -> Option<&ZkError> {
        match self {
            Error::Zk(e) => Some(e),
            _ => None,
        }
    }

    /// True when the underlying coordinator error reports a missing node.
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::Zk(ZkError::NoNode(_)))
    }

    /// True when the underlying coordinator error reports an existing node.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::Zk(ZkError::NodeExists(_)))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
