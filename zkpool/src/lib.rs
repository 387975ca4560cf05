// Copyright 2020 Joyent, Inc.

//! A distributed object pool coordinated through ZooKeeper
//!
//! zkpool is a library for sharing a fixed-capacity pool of objects among a
//! set of cooperating processes, the pool's *participants*. All of the
//! bookkeeping for the pool lives in a ZooKeeper-style coordination service so
//! that every participant sees the same pool: which objects exist, which are
//! free, which are in use, and who is taking part. The pool relies on two
//! primary abstractions: the
//! [`ObjectFactory`](factory/trait.ObjectFactory.html) trait that knows how to
//! manage the pooled objects, and the
//! [`Connector`](coordinator/trait.Connector.html) trait that opens sessions
//! with the coordination service.
//!
//! ## Object factories
//!
//! An *object factory* creates, validates, destroys, serializes and
//! deserializes pooled objects. Objects are never shipped between
//! participants; only their serialized form is stored with the coordinator.
//! A participant borrowing an object materializes it from those bytes, so the
//! serialized form must carry whatever is needed to rebuild a working object.
//! A connection to a remote service, for example, would serialize the address
//! of its backend.
//!
//! A factory may report an object as a *zombie* when it can neither confirm
//! that the object is valid nor safely destroy it. Zombies are set aside and
//! retried periodically until their fate is known.
//!
//! ## Pool layout
//!
//! A pool named `name` is kept under `/name` with these children:
//!
//! | Path           | Contents                                             |
//! |----------------|------------------------------------------------------|
//! | `master`       | one sequential node per object, holding its payload  |
//! | `unused`       | objects free to borrow                               |
//! | `used`         | ephemeral markers for borrowed objects               |
//! | `zombies`      | objects of indeterminate state                       |
//! | `participants` | one ephemeral sequential node per participant        |
//! | `*-lock`       | cross-participant locks                              |
//!
//! Because `used` markers are ephemeral, the objects held by a participant
//! that crashes lose their marker with its session. The crash detector on
//! the surviving participants notices the shrinking participant list and
//! files such orphans back under `unused`.
//!
//! ## Supervisors
//!
//! Each participant runs a set of background supervisors for as long as it
//! belongs to the pool:
//!
//! * the crash detector described above
//! * eviction, which destroys objects left idle for longer than
//!   `max_idle_interval`, if `evict_interval` is set
//! * the zombie reconciler, which revalidates zombies every
//!   `zombie_detection_interval`
//! * the metrics reporter, which logs pool activity every `metric_interval`,
//!   if set
//!
//! All intervals are measured in the pool's
//! [`IntervalUnit`](config/enum.IntervalUnit.html), seconds by default.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//!
//! use slog::{o, Drain, Logger};
//!
//! use zkpool::config::PoolOptions;
//! use zkpool::coordinator::memory::MemoryEnsemble;
//! use zkpool::ZkObjectPool;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let mut options =
//!     PoolOptions::new("widgets", "127.0.0.1:2181".parse()?, 10);
//! options.init_size = Some(2);
//! options.log = Some(log);
//!
//! let pool = ZkObjectPool::new(options, MemoryEnsemble::default(), WidgetFactory);
//! pool.initialize()?;
//!
//! if let Some(widget) = pool.borrow() {
//!     // Do stuff here
//!     pool.return_object(widget);
//! }
//!
//! pool.shutdown()?;
//! ```
//!
//! In production, pools connect through a
//! [`ZooKeeperConnector`](coordinator/zookeeper/struct.ZooKeeperConnector.html),
//! which resolves the connect string and talks to a real ensemble. The
//! [`MemoryEnsemble`](coordinator/memory/struct.MemoryEnsemble.html) used
//! above is an in-process stand-in for tests and examples. Any other
//! coordination service with ZooKeeper's semantics can be plugged in by
//! implementing [`Connector`](coordinator/trait.Connector.html) and
//! [`Session`](coordinator/trait.Session.html).
//!
//! ## [`ObjectFactory`](factory/trait.ObjectFactory.html) trait implementer
//!
//! * `tcp-stream-factory`

#![allow(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod net;
pub mod object_pool;
pub mod paths;
pub mod tasks;
pub mod zk_client;

pub use crate::config::{IntervalUnit, PoolOptions, ZkConnectString};
pub use crate::error::{Error, Result};
pub use crate::factory::{FactoryError, ObjectFactory};
pub use crate::object_pool::types::{PoolState, PooledObject};
pub use crate::object_pool::ZkObjectPool;
pub use crate::paths::ObjectId;
