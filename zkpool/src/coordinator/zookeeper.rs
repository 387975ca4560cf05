// Copyright 2020 Joyent, Inc.

//! A coordinator backed by a ZooKeeper ensemble.
//!
//! `ZooKeeperConnector` speaks the ZooKeeper wire protocol through
//! `tokio_zookeeper`. The client is futures based, so the connector owns a
//! tokio runtime: every request is spawned onto it and the calling thread
//! blocks until the reply arrives or the request times out. Watch callbacks
//! and session state changes are handed to a per-session event thread,
//! never run on the runtime, so they are free to issue further requests.
//!
//! ```rust,no_run
//! use std::str::FromStr;
//!
//! use zkpool::config::ZkConnectString;
//! use zkpool::config::PoolOptions;
//! use zkpool::coordinator::zookeeper::ZooKeeperConnector;
//!
//! let connector = ZooKeeperConnector::new(None).unwrap();
//! let cs = ZkConnectString::from_str("zk1.example.com:2181").unwrap();
//! let options = PoolOptions::new("widgets", cs, 8);
//! // ZkObjectPool::new(options, connector, factory)
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use futures::sync::oneshot;
use rand::seq::SliceRandom;
use slog::{debug, info, o, trace, warn, Drain, Logger};
use tokio::executor::Executor;
use tokio::prelude::*;
use tokio::runtime::Runtime;
use tokio_zookeeper::error as zk_error;
use tokio_zookeeper::{
    Acl, CreateMode as ZkCreateMode, KeeperState as ZkKeeperState,
    MultiResponse, Stat as ZkStat, WatchedEvent as ZkWatchedEvent,
    WatchedEventType as ZkWatchedEventType, ZooKeeper, ZooKeeperBuilder,
};

use crate::config::ZkConnectString;
use crate::coordinator::{
    Connector, CreateMode, KeeperState, Op, OpResult, Session, SessionId,
    SessionWatcher, Stat, WatchedEvent, WatchedEventType, Watcher, ZkError,
    ZkResult,
};

//
// Timeout for the TCP connect and session handshake with one server.
//
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send>;

// Session ids handed out by this process. The protocol client does not
// expose the server-assigned id.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn locked<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

//
// Spawn `fut` onto the runtime and wait for its outcome. Transport failures
// and timeouts are reported as a lost connection.
//
fn block_on<T, E, Fut>(
    runtime: &Mutex<Runtime>,
    timeout: Duration,
    what: &str,
    log: &Logger,
    fut: Fut,
) -> ZkResult<T>
where
    T: Send + 'static,
    E: fmt::Debug + Send + 'static,
    Fut: Future<Item = T, Error = E> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task = fut.timeout(timeout).then(move |result| {
        let _ = tx.send(result.map_err(|e| format!("{:?}", e)));
        Ok::<(), ()>(())
    });

    let mut executor = locked(runtime).executor();
    if Executor::spawn(&mut executor, Box::new(task)).is_err() {
        warn!(log, "{} could not be scheduled, runtime is gone", what);
        return Err(ZkError::ConnectionLoss);
    }

    match rx.wait() {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => {
            debug!(log, "{} failed: {}", what, e);
            Err(ZkError::ConnectionLoss)
        }
        Err(_) => Err(ZkError::ConnectionLoss),
    }
}

fn create_mode(mode: CreateMode) -> ZkCreateMode {
    match mode {
        CreateMode::Persistent => ZkCreateMode::Persistent,
        CreateMode::PersistentSequential => ZkCreateMode::PersistentSequential,
        CreateMode::Ephemeral => ZkCreateMode::Ephemeral,
        CreateMode::EphemeralSequential => ZkCreateMode::EphemeralSequential,
    }
}

fn stat(s: &ZkStat) -> Stat {
    Stat {
        czxid: s.czxid as u64,
        ctime: s.ctime,
        mtime: s.mtime,
        version: s.version as u32,
        num_children: s.num_children as usize,
        ephemeral_owner: match s.ephemeral_owner {
            0 => None,
            owner => Some(owner as u64),
        },
    }
}

fn keeper_state(state: ZkKeeperState) -> KeeperState {
    match state {
        ZkKeeperState::SyncConnected
        | ZkKeeperState::ConnectedReadOnly
        | ZkKeeperState::SaslAuthenticated => KeeperState::SyncConnected,
        ZkKeeperState::Disconnected => KeeperState::Disconnected,
        ZkKeeperState::Expired | ZkKeeperState::AuthFailed => {
            KeeperState::Expired
        }
    }
}

fn watched_event(event: ZkWatchedEvent) -> WatchedEvent {
    let event_type = match event.event_type {
        ZkWatchedEventType::NodeCreated => WatchedEventType::NodeCreated,
        ZkWatchedEventType::NodeDeleted => WatchedEventType::NodeDeleted,
        ZkWatchedEventType::NodeDataChanged => {
            WatchedEventType::NodeDataChanged
        }
        ZkWatchedEventType::NodeChildrenChanged => {
            WatchedEventType::NodeChildrenChanged
        }
        // Session events and removed watches.
        _ => WatchedEventType::None,
    };
    WatchedEvent {
        event_type,
        keeper_state: keeper_state(event.keeper_state),
        path: if event.path.is_empty() {
            None
        } else {
            Some(event.path)
        },
    }
}

fn create_error(path: &str, e: zk_error::Create) -> ZkError {
    match e {
        zk_error::Create::NodeExists => ZkError::NodeExists(String::from(path)),
        zk_error::Create::NoNode => ZkError::NoNode(String::from(path)),
        zk_error::Create::NoChildrenForEphemerals => {
            ZkError::NoChildrenForEphemerals(String::from(path))
        }
        other => ZkError::BadArguments(format!("{}: {:?}", path, other)),
    }
}

fn delete_error(path: &str, e: zk_error::Delete) -> ZkError {
    match e {
        zk_error::Delete::NoNode => ZkError::NoNode(String::from(path)),
        zk_error::Delete::NotEmpty => ZkError::NotEmpty(String::from(path)),
        other => ZkError::BadArguments(format!("{}: {:?}", path, other)),
    }
}

//
// Fold per-op multi results into one outcome. The op that caused the
// rollback decides the error; the others only report that they were
// rolled back or skipped.
//
fn multi_result(
    ops: &[Op],
    results: Vec<Result<MultiResponse, zk_error::Multi>>,
) -> ZkResult<Vec<OpResult>> {
    let mut applied = Vec::with_capacity(results.len());
    let mut failure = None;
    for (op, result) in ops.iter().zip(results) {
        match result {
            Ok(MultiResponse::Create(path)) => {
                applied.push(OpResult::Created(path))
            }
            Ok(MultiResponse::Delete) => applied.push(OpResult::Deleted),
            Ok(other) => {
                return Err(ZkError::BadArguments(format!(
                    "unexpected transaction response {:?}",
                    other
                )))
            }
            Err(zk_error::Multi::RolledBack) | Err(zk_error::Multi::Skipped) => {
            }
            Err(zk_error::Multi::Create(e)) => {
                failure = failure.or_else(|| Some(create_error(op.path(), e)))
            }
            Err(zk_error::Multi::Delete(e)) => {
                failure = failure.or_else(|| Some(delete_error(op.path(), e)))
            }
            Err(e) => {
                failure = failure.or_else(|| {
                    Some(ZkError::BadArguments(format!("{}: {:?}", op.path(), e)))
                })
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None if applied.len() == ops.len() => Ok(applied),
        None => Err(ZkError::BadArguments(String::from(
            "transaction rolled back",
        ))),
    }
}

// State shared by a session and the task draining its default watcher.
struct SessionShared {
    state: Mutex<KeeperState>,
    events: Mutex<Sender<Job>>,
}

impl SessionShared {
    fn post(&self, job: Job) {
        let _ = locked(&self.events).send(job);
    }

    fn transition(&self, state: KeeperState, watcher: &SessionWatcher) {
        {
            let mut current = locked(&self.state);
            if *current == KeeperState::Closed || *current == state {
                return;
            }
            *current = state;
        }
        let watcher = Arc::clone(watcher);
        self.post(Box::new(move || watcher(WatchedEvent::session(state))));
    }
}

/// Opens sessions against a ZooKeeper ensemble. Clones share one runtime.
#[derive(Clone)]
pub struct ZooKeeperConnector {
    runtime: Arc<Mutex<Runtime>>,
    log: Logger,
}

impl ZooKeeperConnector {
    pub fn new(log: Option<Logger>) -> io::Result<Self> {
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("component" => "zookeeper-connector"));
        Ok(ZooKeeperConnector {
            runtime: Arc::new(Mutex::new(Runtime::new()?)),
            log,
        })
    }

    fn connect_to(
        &self,
        addr: SocketAddr,
        session_timeout: Duration,
        watcher: &SessionWatcher,
    ) -> ZkResult<Arc<dyn Session>> {
        let id = NEXT_SESSION.fetch_add(1, Ordering::SeqCst);
        let log = self.log.new(o!("session" => id));

        let (events_tx, events_rx) = channel::<Job>();
        thread::Builder::new()
            .name(format!("zk-session-{}", id))
            .spawn(move || {
                for job in events_rx.iter() {
                    job();
                }
            })
            .map_err(|e| ZkError::BadArguments(e.to_string()))?;

        let shared = Arc::new(SessionShared {
            state: Mutex::new(KeeperState::Disconnected),
            events: Mutex::new(events_tx),
        });

        let mut builder = ZooKeeperBuilder::default();
        builder.set_timeout(session_timeout);
        builder.set_logger(log.new(o!("component" => "tokio-zookeeper")));

        let watch_shared = Arc::clone(&shared);
        let watch_watcher = Arc::clone(watcher);
        let watch_log = log.clone();
        let connecting = builder.connect(&addr).and_then(move |(zk, events)| {
            let end_shared = Arc::clone(&watch_shared);
            let end_watcher = Arc::clone(&watch_watcher);
            tokio::spawn(
                events
                    .for_each(move |event| {
                        trace!(watch_log, "default watcher event";
                            "event" => format!("{:?}", event));
                        if matches!(event.event_type, ZkWatchedEventType::None) {
                            watch_shared.transition(
                                keeper_state(event.keeper_state),
                                &watch_watcher,
                            );
                        }
                        Ok(())
                    })
                    .then(move |_| {
                        end_shared
                            .transition(KeeperState::Disconnected, &end_watcher);
                        Ok(())
                    }),
            );
            Ok(zk)
        });

        let zk = block_on(
            &self.runtime,
            TCP_CONNECT_TIMEOUT,
            "connect",
            &log,
            connecting,
        )?;

        info!(log, "connected to ZooKeeper"; "addr" => addr.to_string());
        shared.transition(KeeperState::SyncConnected, watcher);

        Ok(Arc::new(ZooKeeperSession {
            id,
            zk: Mutex::new(Some(zk)),
            shared,
            runtime: Arc::clone(&self.runtime),
            request_timeout: session_timeout,
            log,
        }))
    }
}

impl Connector for ZooKeeperConnector {
    fn connect(
        &self,
        connect_string: &ZkConnectString,
        session_timeout: Duration,
        watcher: SessionWatcher,
    ) -> ZkResult<Arc<dyn Session>> {
        let mut addrs = connect_string.resolve().map_err(|e| {
            warn!(self.log, "unable to resolve {}: {}",
                connect_string.to_string(), e);
            ZkError::ConnectionLoss
        })?;
        addrs.shuffle(&mut rand::thread_rng());

        for addr in addrs {
            match self.connect_to(addr, session_timeout, &watcher) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(self.log, "unable to connect to {}: {}", addr, e)
                }
            }
        }
        Err(ZkError::ConnectionLoss)
    }
}

struct ZooKeeperSession {
    id: SessionId,
    zk: Mutex<Option<ZooKeeper>>,
    shared: Arc<SessionShared>,
    runtime: Arc<Mutex<Runtime>>,
    request_timeout: Duration,
    log: Logger,
}

impl ZooKeeperSession {
    fn handle(&self) -> ZkResult<ZooKeeper> {
        match *locked(&self.shared.state) {
            KeeperState::SyncConnected => (),
            KeeperState::Disconnected => return Err(ZkError::ConnectionLoss),
            KeeperState::Expired | KeeperState::Closed => {
                return Err(ZkError::SessionExpired)
            }
        }
        locked(&self.zk).clone().ok_or(ZkError::SessionExpired)
    }

    fn request<T, E, Fut>(&self, what: &str, fut: Fut) -> ZkResult<T>
    where
        T: Send + 'static,
        E: fmt::Debug + Send + 'static,
        Fut: Future<Item = T, Error = E> + Send + 'static,
    {
        block_on(&self.runtime, self.request_timeout, what, &self.log, fut)
    }

    // Hand a one-shot watch to the event thread once it fires. A watch
    // cancelled with its session is dropped.
    fn deliver<W>(&self, fired: W, watcher: Watcher)
    where
        W: Future<Item = ZkWatchedEvent> + Send + 'static,
        W::Error: Send,
    {
        let events = locked(&self.shared.events).clone();
        let task = fired.then(move |event| {
            if let Ok(event) = event {
                let event = watched_event(event);
                let _ = events.send(Box::new(move || watcher(event)));
            }
            Ok::<(), ()>(())
        });
        let mut executor = locked(&self.runtime).executor();
        if Executor::spawn(&mut executor, Box::new(task)).is_err() {
            warn!(self.log, "unable to arm watch, runtime is gone");
        }
    }
}

impl Session for ZooKeeperSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> KeeperState {
        *locked(&self.shared.state)
    }

    fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> ZkResult<String> {
        let zk = self.handle()?;
        let result = self.request(
            "create",
            zk.create(path, data.to_vec(), Acl::open_unsafe(), create_mode(mode))
                .map(|(_, res)| res),
        )?;
        result.map_err(|e| create_error(path, e))
    }

    fn delete(&self, path: &str) -> ZkResult<()> {
        let zk = self.handle()?;
        let result =
            self.request("delete", zk.delete(path, None).map(|(_, res)| res))?;
        result.map_err(|e| delete_error(path, e))
    }

    fn exists(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> ZkResult<Option<Stat>> {
        let zk = self.handle()?;
        match watcher {
            None => {
                let found = self
                    .request("exists", zk.exists(path).map(|(_, stat)| stat))?;
                Ok(found.as_ref().map(stat))
            }
            Some(watcher) => {
                let (fired, found) = self.request(
                    "exists",
                    zk.with_watcher()
                        .exists(path)
                        .map(|(_, fired, stat)| (fired, stat)),
                )?;
                self.deliver(fired, watcher);
                Ok(found.as_ref().map(stat))
            }
        }
    }

    fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> ZkResult<Vec<String>> {
        let zk = self.handle()?;
        let no_node = || ZkError::NoNode(String::from(path));
        match watcher {
            None => self
                .request(
                    "get children",
                    zk.get_children(path).map(|(_, children)| children),
                )?
                .ok_or_else(no_node),
            Some(watcher) => {
                let (fired, children) = self
                    .request(
                        "get children",
                        zk.with_watcher()
                            .get_children(path)
                            .map(|(_, found)| found),
                    )?
                    .ok_or_else(no_node)?;
                self.deliver(fired, watcher);
                Ok(children)
            }
        }
    }

    fn get_data(&self, path: &str) -> ZkResult<(Vec<u8>, Stat)> {
        let zk = self.handle()?;
        self.request("get data", zk.get_data(path).map(|(_, found)| found))?
            .map(|(data, s)| (data, stat(&s)))
            .ok_or_else(|| ZkError::NoNode(String::from(path)))
    }

    fn multi(&self, ops: &[Op]) -> ZkResult<Vec<OpResult>> {
        let zk = self.handle()?;
        let builder = ops.iter().fold(zk.multi(), |builder, op| match op {
            Op::Create { path, data, mode } => builder.create(
                path,
                data.clone(),
                Acl::open_unsafe(),
                create_mode(*mode),
            ),
            Op::Delete { path } => builder.delete(path, None),
        });
        let results = self
            .request("transaction", builder.run().map(|(_, results)| results))?;
        multi_result(ops, results)
    }

    // The client has no sync request. Replies on one connection arrive in
    // order, so a read round trip is ordered after every earlier write.
    fn sync(&self, path: &str) -> ZkResult<()> {
        self.exists(path, None).map(|_| ())
    }

    fn close(&self) {
        *locked(&self.shared.state) = KeeperState::Closed;
        if locked(&self.zk).take().is_some() {
            debug!(self.log, "closed session");
        }
    }
}

impl Drop for ZooKeeperSession {
    fn drop(&mut self) {
        self.close();
    }
}
