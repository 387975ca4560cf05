// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::paths::ObjectId;

/// Sum type representing the current state of the pool on this participant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// The pool has been constructed but not initialized.
    Created,
    /// The pool is running and able to service borrow requests.
    Running,
    /// The pool is performing shutdown and no longer hands out objects.
    Stopping,
    /// The pool is stopped and is no longer accepting borrow requests.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Created => String::from("created").fmt(fmt),
            PoolState::Running => String::from("running").fmt(fmt),
            PoolState::Stopping => String::from("stopping").fmt(fmt),
            PoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}

/// An object borrowed from the pool.
///
/// The handle dereferences to the object. Hand it back with
/// [`return_object`](../struct.ZkObjectPool.html#method.return_object) or
/// destroy it with
/// [`invalidate`](../struct.ZkObjectPool.html#method.invalidate). Simply
/// dropping the handle leaves the object marked as used until this
/// participant leaves the pool.
#[derive(Debug)]
pub struct PooledObject<T> {
    id: ObjectId,
    object: T,
}

impl<T> PooledObject<T> {
    pub(crate) fn new(id: ObjectId, object: T) -> Self {
        PooledObject { id, object }
    }

    /// The pool-wide id of the object.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub(crate) fn into_parts(self) -> (ObjectId, T) {
        (self.id, self.object)
    }
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}
