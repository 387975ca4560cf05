// Copyright 2020 Joyent, Inc.

mod common;

use std::thread;
use std::time::Duration;

use zkpool::coordinator::memory::MemoryEnsemble;

use common::{options, pool_name, start_pool, wait_until, TestObjectFactory};

#[test]
fn idle_objects_are_evicted() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let mut opts = options(&pool_name(), 5, 3);
    opts.evict_interval = Some(100);
    opts.max_idle_interval = Some(200);
    opts.num_tests_per_eviction = Some(10);
    let pool = start_pool(&ensemble, opts, &factory);

    let held = pool.borrow().expect("borrow");

    assert!(wait_until(Duration::from_secs(5), || {
        pool.metrics().unwrap().evicted == 2
    }));
    // Borrowed objects are never idle.
    assert_eq!(pool.size().unwrap(), 1);
    assert_eq!(pool.unused().unwrap(), 0);
    assert_eq!(factory.counters.destroyed(), 2);

    pool.return_object(held);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.size().unwrap() == 0
    }));

    pool.shutdown().unwrap();
}

#[test]
fn invalid_idle_objects_count_as_evicted() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    factory.behaviour.set_invalid(1, true);
    let mut opts = options(&pool_name(), 2, 2);
    opts.evict_interval = Some(100);
    opts.max_idle_interval = Some(200);
    opts.num_tests_per_eviction = Some(10);
    let pool = start_pool(&ensemble, opts, &factory);

    assert!(wait_until(Duration::from_secs(5), || {
        pool.metrics().unwrap().evicted == 2
    }));
    assert_eq!(pool.size().unwrap(), 0);
    assert_eq!(factory.counters.destroyed(), 2);

    pool.shutdown().unwrap();
}

#[test]
fn recently_used_objects_survive() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let mut opts = options(&pool_name(), 2, 2);
    opts.evict_interval = Some(50);
    opts.max_idle_interval = Some(60_000);
    let pool = start_pool(&ensemble, opts, &factory);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(pool.size().unwrap(), 2);
    assert_eq!(factory.counters.destroyed(), 0);

    pool.shutdown().unwrap();
}

#[test]
fn sweeps_inspect_a_bounded_number_of_objects() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let mut opts = options(&pool_name(), 4, 4);
    opts.evict_interval = Some(400);
    opts.max_idle_interval = Some(1);
    opts.num_tests_per_eviction = Some(1);
    let pool = start_pool(&ensemble, opts, &factory);

    // At most one sweep has run.
    thread::sleep(Duration::from_millis(500));
    assert!(pool.size().unwrap() >= 3);

    assert!(wait_until(Duration::from_secs(5), || {
        pool.size().unwrap() == 0
    }));
    assert_eq!(factory.counters.destroyed(), 4);

    pool.shutdown().unwrap();
}

#[test]
fn eviction_disabled_without_interval() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let mut opts = options(&pool_name(), 2, 2);
    opts.max_idle_interval = Some(1);
    let pool = start_pool(&ensemble, opts, &factory);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.size().unwrap(), 2);

    pool.shutdown().unwrap();
}
