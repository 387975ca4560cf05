// Copyright 2020 Joyent, Inc.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use slog::{info, o, Drain, Logger};

use zkpool::config::{PoolOptions, ZkConnectString};
use zkpool::coordinator::memory::MemoryEnsemble;
use zkpool::coordinator::zookeeper::ZooKeeperConnector;
use zkpool::coordinator::Connector;
use zkpool::factory::{FactoryError, ObjectFactory};
use zkpool::ZkObjectPool;

#[derive(Debug, Serialize, Deserialize)]
pub struct DummyObject {
    serial: u64,
}

#[derive(Default)]
pub struct DummyFactory {
    next: AtomicU64,
}

impl ObjectFactory for DummyFactory {
    type Object = DummyObject;

    fn create(&self) -> Result<DummyObject, FactoryError> {
        Ok(DummyObject {
            serial: self.next.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn validate(&self, _obj: &DummyObject) -> Result<bool, FactoryError> {
        Ok(true)
    }

    fn destroy(&self, _obj: DummyObject) -> Result<(), FactoryError> {
        Ok(())
    }

    fn serialize(&self, obj: &DummyObject) -> Result<Vec<u8>, FactoryError> {
        serde_json::to_vec(obj).map_err(FactoryError::failed)
    }

    fn deserialize(&self, data: &[u8]) -> Result<DummyObject, FactoryError> {
        serde_json::from_slice(data).map_err(FactoryError::failed)
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic zkpool example");

    // Set ZK_CONNECT_STRING to run against a real ensemble.
    match std::env::var("ZK_CONNECT_STRING") {
        Ok(cs) => {
            let connector = ZooKeeperConnector::new(Some(log.clone())).unwrap();
            run(&log, connector, ZkConnectString::from_str(&cs).unwrap())
        }
        Err(_) => run(
            &log,
            MemoryEnsemble::new(Some(log.clone())),
            ZkConnectString::from_str("127.0.0.1:2181").unwrap(),
        ),
    }
}

fn run<C>(log: &Logger, connector: C, connect_string: ZkConnectString)
where
    C: Connector + Clone,
{
    // Two participants sharing one pool of three objects
    let participants: Vec<_> = (0..2)
        .map(|_| {
            let mut options =
                PoolOptions::new("example", connect_string.clone(), 3);
            options.init_size = Some(1);
            options.metric_interval = Some(1);
            options.log = Some(log.clone());

            let pool = ZkObjectPool::new(
                options,
                connector.clone(),
                DummyFactory::default(),
            );
            pool.initialize().unwrap();
            Arc::new(pool)
        })
        .collect();

    let barrier1 = Arc::new(Barrier::new(4));
    let barrier2 = Arc::new(Barrier::new(4));
    let threads: Vec<_> = (0..3)
        .map(|i| {
            let pool = Arc::clone(&participants[i % 2]);
            let barrier1 = Arc::clone(&barrier1);
            let barrier2 = Arc::clone(&barrier2);
            let log = log.clone();
            thread::spawn(move || {
                let obj = pool.borrow();
                info!(log, "thread {} borrowed {:?}", i, obj.as_deref());
                barrier1.wait();
                barrier2.wait();
                if let Some(obj) = obj {
                    pool.return_object(obj);
                }
            })
        })
        .collect();

    // With every object out neither participant can borrow.
    barrier1.wait();
    for pool in &participants {
        match pool.borrow() {
            Some(obj) => pool.return_object(obj),
            None => info!(log, "pool is at capacity"),
        }
    }
    barrier2.wait();

    for t in threads {
        let _ = t.join();
    }

    info!(log, "pool size: {}", participants[0].size().unwrap());
    info!(log, "participants: {:?}", participants[0].participants().unwrap());

    for pool in participants {
        pool.shutdown().unwrap();
    }
}
