// Copyright 2020 Joyent, Inc.

mod common;

use std::time::Duration;

use zkpool::coordinator::memory::MemoryEnsemble;

use common::{options, pool_name, start_pool, wait_until, TestObjectFactory};

#[test]
fn expired_participant_objects_are_restored() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();
    let crashing = start_pool(&ensemble, options(&name, 3, 3), &factory);
    let survivor = start_pool(&ensemble, options(&name, 3, 3), &factory);

    let a = crashing.borrow().expect("borrow");
    let b = crashing.borrow().expect("borrow");
    assert_eq!(survivor.used().unwrap(), 2);

    let session = crashing.zk().session_id().expect("session");
    ensemble.expire_session(session);

    assert!(wait_until(Duration::from_secs(5), || {
        survivor.unused().unwrap() == 3
    }));
    assert_eq!(survivor.used().unwrap(), 0);
    assert_eq!(survivor.size().unwrap(), 3);
    assert_eq!(survivor.metrics().unwrap().restored, 2);

    // The crashed participant's handles are stale; returning them must not
    // duplicate anything.
    crashing.return_object(a);
    crashing.return_object(b);
    assert_eq!(survivor.unused().unwrap(), 3);
    assert_eq!(survivor.size().unwrap(), 3);

    crashing.shutdown().unwrap();
    survivor.shutdown().unwrap();
}

#[test]
fn dropped_participant_objects_are_restored() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();
    let survivor = start_pool(&ensemble, options(&name, 2, 2), &factory);

    {
        let leaving = start_pool(&ensemble, options(&name, 2, 2), &factory);
        let obj = leaving.borrow().expect("borrow");
        assert_eq!(survivor.used().unwrap(), 1);
        // Drop the handle and the pool without a shutdown.
        drop(obj);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        survivor.unused().unwrap() == 2
    }));
    assert_eq!(survivor.participants().unwrap().len(), 1);
    assert_eq!(factory.counters.destroyed(), 0);

    survivor.shutdown().unwrap();
}

#[test]
fn zombies_are_left_for_the_reconciler() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();
    factory.behaviour.set_zombie(1, true);
    let crashing = start_pool(&ensemble, options(&name, 2, 1), &factory);
    let survivor = start_pool(&ensemble, options(&name, 2, 1), &factory);

    let obj = crashing.borrow().expect("borrow");
    assert_eq!(obj.serial, 2);
    assert_eq!(survivor.zombies().unwrap(), 1);

    let session = crashing.zk().session_id().expect("session");
    ensemble.expire_session(session);

    assert!(wait_until(Duration::from_secs(5), || {
        survivor.unused().unwrap() == 1
    }));
    assert_eq!(survivor.zombies().unwrap(), 1);
    assert_eq!(survivor.used().unwrap(), 0);

    drop(obj);
    crashing.shutdown().unwrap();
    survivor.shutdown().unwrap();
}

#[test]
fn participant_rejoins_after_session_expiry() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();
    let pool = start_pool(&ensemble, options(&name, 2, 1), &factory);
    let other = start_pool(&ensemble, options(&name, 2, 1), &factory);

    let session = pool.zk().session_id().expect("session");
    ensemble.expire_session(session);
    assert!(wait_until(Duration::from_secs(5), || {
        other.participants().unwrap().len() == 1
    }));

    // The next borrow reconnects and registers again.
    let obj = pool.borrow().expect("borrow");
    assert_ne!(pool.zk().session_id(), Some(session));
    assert_eq!(other.participants().unwrap().len(), 2);

    pool.return_object(obj);
    pool.shutdown().unwrap();
    other.shutdown().unwrap();
}

#[test]
fn stale_return_does_not_release_anothers_object() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();
    let crashing = start_pool(&ensemble, options(&name, 2, 1), &factory);
    let survivor = start_pool(&ensemble, options(&name, 2, 1), &factory);

    let stale = crashing.borrow().expect("borrow");
    let id = stale.id().clone();

    let session = crashing.zk().session_id().expect("session");
    ensemble.expire_session(session);
    assert!(wait_until(Duration::from_secs(5), || {
        survivor.unused().unwrap() == 1
    }));

    let held = survivor.borrow().expect("borrow");
    assert_eq!(held.id(), &id);

    crashing.return_object(stale);
    assert_eq!(crashing.borrowed(), 0);
    assert_eq!(survivor.unused().unwrap(), 0);
    assert_eq!(survivor.used().unwrap(), 1);
    assert!(survivor
        .zk()
        .exists(&survivor.paths().used_node(&id))
        .unwrap());

    // The next borrow must not hand out the object the survivor holds.
    let fresh = crashing.borrow().expect("borrow");
    assert_ne!(fresh.id(), &id);
    assert_eq!(survivor.size().unwrap(), 2);

    crashing.return_object(fresh);
    survivor.return_object(held);
    crashing.shutdown().unwrap();
    survivor.shutdown().unwrap();
}

#[test]
fn stale_invalidate_leaves_object_alone() {
    let ensemble = MemoryEnsemble::default();
    let factory = TestObjectFactory::new();
    let name = pool_name();
    let crashing = start_pool(&ensemble, options(&name, 2, 1), &factory);
    let survivor = start_pool(&ensemble, options(&name, 2, 1), &factory);

    let stale = crashing.borrow().expect("borrow");
    let session = crashing.zk().session_id().expect("session");
    ensemble.expire_session(session);
    assert!(wait_until(Duration::from_secs(5), || {
        survivor.unused().unwrap() == 1
    }));

    assert!(!crashing.invalidate(stale));
    assert_eq!(factory.counters.destroyed(), 0);
    assert_eq!(survivor.size().unwrap(), 1);
    assert_eq!(survivor.unused().unwrap(), 1);

    crashing.shutdown().unwrap();
    survivor.shutdown().unwrap();
}
