// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use slog::{o, Drain, Level, Logger};
use uuid::Uuid;

use zkpool::config::{IntervalUnit, PoolOptions, ZkConnectString};
use zkpool::coordinator::memory::MemoryEnsemble;
use zkpool::factory::{FactoryError, ObjectFactory};
use zkpool::ZkObjectPool;

pub const CONNECT_STRING: &str = "127.0.0.1:2181";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestObject {
    pub serial: u64,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub validated: AtomicUsize,
    next_serial: AtomicU64,
}

impl Counters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

// Per-object behaviour, keyed by serial number.
#[derive(Debug, Default)]
pub struct Behaviour {
    pub invalid: Mutex<HashSet<u64>>,
    pub zombie: Mutex<HashSet<u64>>,
    pub zombie_on_destroy: Mutex<HashSet<u64>>,
}

impl Behaviour {
    pub fn set_invalid(&self, serial: u64, on: bool) {
        toggle(&self.invalid, serial, on)
    }

    pub fn set_zombie(&self, serial: u64, on: bool) {
        toggle(&self.zombie, serial, on)
    }

    pub fn set_zombie_on_destroy(&self, serial: u64, on: bool) {
        toggle(&self.zombie_on_destroy, serial, on)
    }
}

fn toggle(set: &Mutex<HashSet<u64>>, serial: u64, on: bool) {
    let mut set = set.lock().unwrap();
    if on {
        set.insert(serial);
    } else {
        set.remove(&serial);
    }
}

/// Hands out numbered objects. Serial numbers start at 1 and are shared by
/// every clone of the factory.
#[derive(Clone, Debug, Default)]
pub struct TestObjectFactory {
    pub counters: Arc<Counters>,
    pub behaviour: Arc<Behaviour>,
}

impl TestObjectFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectFactory for TestObjectFactory {
    type Object = TestObject;

    fn create(&self) -> Result<TestObject, FactoryError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let serial = self.counters.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestObject { serial })
    }

    fn validate(&self, obj: &TestObject) -> Result<bool, FactoryError> {
        self.counters.validated.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.zombie.lock().unwrap().contains(&obj.serial) {
            return Err(FactoryError::zombie(format!("object {}", obj.serial)));
        }
        Ok(!self.behaviour.invalid.lock().unwrap().contains(&obj.serial))
    }

    fn destroy(&self, obj: TestObject) -> Result<(), FactoryError> {
        if self
            .behaviour
            .zombie_on_destroy
            .lock()
            .unwrap()
            .contains(&obj.serial)
        {
            return Err(FactoryError::zombie(format!("object {}", obj.serial)));
        }
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn serialize(&self, obj: &TestObject) -> Result<Vec<u8>, FactoryError> {
        serde_json::to_vec(obj).map_err(FactoryError::failed)
    }

    fn deserialize(&self, data: &[u8]) -> Result<TestObject, FactoryError> {
        serde_json::from_slice(data).map_err(FactoryError::failed)
    }
}

/// A logger for tests. Nothing is printed unless ZKPOOL_LOG_LEVEL names a
/// level, e.g. `ZKPOOL_LOG_LEVEL=debug`.
pub fn test_logger() -> Logger {
    let level = env::var("ZKPOOL_LOG_LEVEL")
        .ok()
        .and_then(|l| Level::from_str(&l).ok());
    match level {
        Some(level) => {
            let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
            Logger::root(
                slog::LevelFilter::new(
                    slog_term::FullFormat::new(plain).build(),
                    level,
                )
                .fuse(),
                o!(),
            )
        }
        None => Logger::root(slog::Discard, o!()),
    }
}

pub fn pool_name() -> String {
    format!("pool-{}", Uuid::new_v4())
}

/// Options for a pool whose supervisors stay out of the way unless a test
/// turns them on.
pub fn options(name: &str, size: u32, init_size: u32) -> PoolOptions {
    let mut options = PoolOptions::new(
        name,
        ZkConnectString::from_str(CONNECT_STRING).unwrap(),
        size,
    );
    options.init_size = Some(init_size);
    options.interval_unit = Some(IntervalUnit::Milliseconds);
    options.zombie_detection_interval = Some(0);
    options.log = Some(test_logger());
    options
}

pub fn new_pool(
    ensemble: &MemoryEnsemble,
    options: PoolOptions,
    factory: &TestObjectFactory,
) -> ZkObjectPool<TestObjectFactory> {
    ZkObjectPool::new(options, ensemble.clone(), factory.clone())
}

pub fn start_pool(
    ensemble: &MemoryEnsemble,
    options: PoolOptions,
    factory: &TestObjectFactory,
) -> ZkObjectPool<TestObjectFactory> {
    let pool = new_pool(ensemble, options, factory);
    pool.initialize().unwrap();
    pool
}

/// Poll `cond` until it holds or `timeout` passes. Returns the final result.
pub fn wait_until<C>(timeout: Duration, mut cond: C) -> bool
where
    C: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
