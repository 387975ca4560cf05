// Copyright 2020 Joyent, Inc.

mod common;

use std::thread;
use std::time::Duration;

use zkpool::config::PoolOptions;
use zkpool::coordinator::memory::MemoryEnsemble;

use common::{options, pool_name, start_pool, wait_until, TestObjectFactory};

fn reconciling(size: u32, init_size: u32) -> PoolOptions {
    let mut opts = options(&pool_name(), size, init_size);
    opts.zombie_detection_interval = Some(50);
    opts
}

#[test]
fn zombie_is_set_aside_on_borrow() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    factory.behaviour.set_zombie(1, true);
    let pool = start_pool(&ensemble, options(&pool_name(), 2, 1), &factory);

    let obj = pool.borrow().expect("borrow");
    assert_eq!(obj.serial, 2);
    assert_eq!(pool.zombies().unwrap(), 1);
    assert_eq!(pool.size().unwrap(), 2);
    assert_eq!(pool.metrics().unwrap().zombies_marked, 1);

    pool.return_object(obj);
    pool.shutdown().unwrap();
}

#[test]
fn zombies_do_not_stall_borrow() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    factory.behaviour.set_zombie(1, true);
    let pool = start_pool(&ensemble, options(&pool_name(), 1, 1), &factory);

    assert!(pool.borrow().is_none());
    assert_eq!(pool.zombies().unwrap(), 1);
    assert_eq!(factory.counters.created(), 1);

    pool.shutdown().unwrap();
}

#[test]
fn recovered_zombie_returns_to_unused() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    factory.behaviour.set_zombie(1, true);
    let pool = start_pool(&ensemble, reconciling(2, 1), &factory);

    let obj = pool.borrow().expect("borrow");
    assert_eq!(obj.serial, 2);

    // Still indeterminate; the reconciler leaves it alone.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.zombies().unwrap(), 1);

    factory.behaviour.set_zombie(1, false);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.zombies().unwrap() == 0 && pool.unused().unwrap() == 1
    }));
    assert_eq!(pool.used().unwrap(), 1);
    assert_eq!(pool.size().unwrap(), 2);
    assert_eq!(pool.metrics().unwrap().zombies_revived, 1);

    pool.return_object(obj);
    pool.shutdown().unwrap();
}

#[test]
fn invalid_zombie_is_dropped() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    factory.behaviour.set_zombie(1, true);
    let pool = start_pool(&ensemble, reconciling(2, 1), &factory);

    let obj = pool.borrow().expect("borrow");
    assert_eq!(pool.zombies().unwrap(), 1);

    factory.behaviour.set_zombie(1, false);
    factory.behaviour.set_invalid(1, true);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.zombies().unwrap() == 0 && pool.size().unwrap() == 1
    }));
    assert_eq!(factory.counters.destroyed(), 1);
    assert_eq!(pool.used().unwrap(), 1);
    assert_eq!(pool.metrics().unwrap().zombies_dropped, 1);

    pool.return_object(obj);
    pool.shutdown().unwrap();
}

#[test]
fn pool_of_zombies_recovers() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    for serial in 1..=5 {
        factory.behaviour.set_zombie(serial, true);
    }
    let mut opts = reconciling(5, 5);
    opts.zombie_detection_interval = Some(200);
    let pool = start_pool(&ensemble, opts, &factory);

    assert!(pool.borrow().is_none());
    assert_eq!(pool.zombies().unwrap(), 5);
    assert_eq!(pool.used().unwrap(), 5);

    for serial in 1..=5 {
        factory.behaviour.set_zombie(serial, false);
    }
    assert!(wait_until(Duration::from_secs(5), || {
        pool.zombies().unwrap() == 0
    }));
    assert_eq!(pool.unused().unwrap(), 5);
    assert_eq!(pool.used().unwrap(), 0);
    assert_eq!(pool.size().unwrap(), 5);

    pool.shutdown().unwrap();
}
