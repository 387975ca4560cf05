// Copyright 2020 Joyent, Inc.

mod common;

use zkpool::coordinator::memory::MemoryEnsemble;
use zkpool::{Error, PoolState};

use common::{new_pool, options, pool_name, start_pool, TestObjectFactory};

#[test]
fn first_participant_builds_and_fills_pool() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();

    let mut opts = options(&name, 5, 3);
    opts.participant_address = Some(String::from("10.1.2.3"));
    let pool = start_pool(&ensemble, opts, &factory);

    assert_eq!(pool.state(), PoolState::Running);
    assert_eq!(pool.size().unwrap(), 3);
    assert_eq!(pool.unused().unwrap(), 3);
    assert_eq!(pool.used().unwrap(), 0);
    assert_eq!(pool.zombies().unwrap(), 0);
    assert_eq!(pool.participants().unwrap(), vec![String::from("10.1.2.3")]);
    assert!(pool.participant_id().is_some());
    assert_eq!(factory.counters.created(), 3);

    let tree = ensemble.dump();
    for path in pool.paths().all() {
        assert!(tree.iter().any(|p| p == path), "missing {}", path);
    }

    pool.shutdown().unwrap();
}

#[test]
fn later_participants_do_not_refill() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();

    let first = start_pool(&ensemble, options(&name, 5, 3), &factory);
    let second = start_pool(&ensemble, options(&name, 5, 3), &factory);

    assert_eq!(second.size().unwrap(), 3);
    assert_eq!(factory.counters.created(), 3);
    assert_eq!(first.participants().unwrap().len(), 2);
    assert_ne!(first.participant_id(), second.participant_id());

    second.shutdown().unwrap();
    first.shutdown().unwrap();
}

#[test]
fn zero_size_is_rejected() {
    let ensemble = MemoryEnsemble::default();
    let pool = new_pool(
        &ensemble,
        options(&pool_name(), 0, 0),
        &TestObjectFactory::new(),
    );
    match pool.initialize() {
        Err(Error::Config(_)) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(ensemble.dump().is_empty());
}

#[test]
fn init_size_over_size_is_rejected() {
    let ensemble = MemoryEnsemble::default();
    let pool = new_pool(
        &ensemble,
        options(&pool_name(), 2, 3),
        &TestObjectFactory::new(),
    );
    assert!(matches!(pool.initialize(), Err(Error::Config(_))));
    assert_eq!(pool.state(), PoolState::Created);
}

#[test]
fn initialize_only_once() {
    let ensemble = MemoryEnsemble::default();
    let pool =
        start_pool(&ensemble, options(&pool_name(), 2, 1), &TestObjectFactory::new());
    assert!(matches!(pool.initialize(), Err(Error::NotRunning(_))));
    assert_eq!(pool.size().unwrap(), 1);
    pool.shutdown().unwrap();
}

#[test]
fn participant_without_address_is_reported_unknown() {
    let ensemble = MemoryEnsemble::default();
    let name = pool_name();
    let mut opts = options(&name, 1, 0);
    opts.participant_address = Some(String::new());
    let pool = start_pool(&ensemble, opts, &TestObjectFactory::new());

    assert_eq!(
        pool.participants().unwrap(),
        vec![String::from("address-unknown")]
    );
    pool.shutdown().unwrap();
}

#[test]
fn concurrent_initialize_fills_once() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let pool = new_pool(&ensemble, options(&name, 5, 5), &factory);
            std::thread::spawn(move || {
                pool.initialize().unwrap();
                pool
            })
        })
        .collect();
    let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(pools[0].size().unwrap(), 5);
    assert_eq!(pools[0].unused().unwrap(), 5);
    assert_eq!(pools[0].participants().unwrap().len(), 2);
    assert_eq!(factory.counters.created(), 5);

    for pool in pools {
        pool.shutdown().unwrap();
    }
}
