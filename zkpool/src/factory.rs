// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;

use thiserror::Error;

/// Errors an [`ObjectFactory`](trait.ObjectFactory.html) reports to the pool.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The state of the object is indeterminate: it could be neither
    /// confirmed valid nor safely destroyed. The pool parks such objects in
    /// the zombie set until the reconciler can decide their fate.
    #[error("zombie object: {0}")]
    Zombie(String),
    /// Any other failure.
    #[error(transparent)]
    Failed(#[from] Box<dyn StdError + Send + Sync>),
}

impl FactoryError {
    pub fn zombie<S: Into<String>>(msg: S) -> Self {
        FactoryError::Zombie(msg.into())
    }

    pub fn failed<E>(e: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        FactoryError::Failed(e.into())
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self, FactoryError::Zombie(_))
    }
}

/// The capability set the pool needs in order to manage objects of some
/// type. Objects themselves never leave the participant that holds them;
/// only their serialized form is stored with the coordinator, so
/// `deserialize` must be able to produce a usable object from the bytes
/// written by `serialize` on any participant.
pub trait ObjectFactory: Send + Sync + 'static {
    type Object: Send + 'static;

    /// Create a brand new object.
    fn create(&self) -> Result<Self::Object, FactoryError>;

    /// Check whether an object is fit for use. Returning
    /// `FactoryError::Zombie` marks the object as a zombie.
    fn validate(&self, obj: &Self::Object) -> Result<bool, FactoryError>;

    /// Release every resource held by the object. Returning
    /// `FactoryError::Zombie` marks the object as a zombie.
    fn destroy(&self, obj: Self::Object) -> Result<(), FactoryError>;

    fn serialize(&self, obj: &Self::Object) -> Result<Vec<u8>, FactoryError>;

    fn deserialize(&self, data: &[u8]) -> Result<Self::Object, FactoryError>;
}
