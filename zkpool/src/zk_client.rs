// Copyright 2020 Joyent, Inc.

//
// The coordinator adapter. Every pool operation goes through a `ZkClient`,
// which owns at most one live session at a time. Sessions are opened lazily
// by the first operation that needs one and replaced whenever the session
// watcher reports that the current one expired or disconnected. Operations
// that fail with a connection error are retried against a fresh session a
// bounded number of times before the error is handed to the caller.
//

pub mod lock;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use backoff::{ExponentialBackoff, Operation};
use slog::{debug, error, info, o, trace, warn, Logger};

use crate::config::ZkConnectString;
use crate::coordinator::{
    Connector, CreateMode, KeeperState, Op, OpResult, Session, SessionId,
    SessionWatcher, Stat, WatchedEvent, ZkError, ZkResult,
};
use crate::error::{Error, Result};

//
// Timeout for coordinator sessions.
//
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

//
// How long to wait for a new session to report that it is connected.
//
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

//
// Attempts made for an operation or transaction that keeps losing its
// connection, and the pause between attempts.
//
pub const MAX_RETRY_COUNT: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

type ReconnectHook = Arc<dyn Fn() + Send + Sync>;
type SharedWatcher = Arc<dyn Fn(WatchedEvent) + Send + Sync>;

// Records the newest connection generation that reported SyncConnected.
struct ConnectLatch {
    connected: Mutex<u64>,
    cond: Condvar,
}

impl ConnectLatch {
    fn new() -> Self {
        ConnectLatch {
            connected: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn open(&self, generation: u64) {
        let mut connected = locked(&self.connected);
        if *connected < generation {
            *connected = generation;
        }
        self.cond.notify_all();
    }

    fn wait(&self, generation: u64, timeout: Duration) -> bool {
        let connected = locked(&self.connected);
        let (connected, _) = self
            .cond
            .wait_timeout_while(connected, timeout, |c| *c < generation)
            .unwrap_or_else(PoisonError::into_inner);
        *connected >= generation
    }
}

struct CurrentSession {
    generation: u64,
    session: Arc<dyn Session>,
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    connect_string: ZkConnectString,
    current: Mutex<Option<CurrentSession>>,
    generation: AtomicU64,
    latch: ConnectLatch,
    reconnect_hooks: Mutex<Vec<ReconnectHook>>,
    connected_once: AtomicBool,
    shutdown: AtomicBool,
    log: Logger,
}

/// A shareable handle on the coordinator adapter.
#[derive(Clone)]
pub struct ZkClient {
    inner: Arc<ClientInner>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ZkClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        connect_string: ZkConnectString,
        log: &Logger,
    ) -> Self {
        ZkClient {
            inner: Arc::new(ClientInner {
                connector,
                connect_string,
                current: Mutex::new(None),
                generation: AtomicU64::new(0),
                latch: ConnectLatch::new(),
                reconnect_hooks: Mutex::new(Vec::new()),
                connected_once: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                log: log.new(o!("component" => "zookeeper")),
            }),
        }
    }

    /// Open a session now instead of waiting for the first operation.
    pub fn connect(&self) -> Result<()> {
        self.session().map(|_| ())
    }

    /// The id of the live session, if there is one.
    pub fn session_id(&self) -> Option<SessionId> {
        locked(&self.inner.current)
            .as_ref()
            .map(|c| c.session.id())
    }

    /// The id of the live session, connecting first if there is none.
    pub fn ensure_session(&self) -> Result<SessionId> {
        self.session().map(|s| s.id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Close the session for good. Every later operation fails with
    /// `Error::Shutdown`, including lock acquisitions already waiting.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(self.inner.log, "shutting down coordinator client");
        locked(&self.inner.reconnect_hooks).clear();
        let current = locked(&self.inner.current).take();
        if let Some(current) = current {
            current.session.close();
        }
    }

    /// Register a callback to run after every reconnect that replaces an
    /// earlier session. Watches die with their session, so this is where
    /// long-lived watches get re-armed.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        locked(&self.inner.reconnect_hooks).push(Arc::new(hook));
    }

    pub fn log(&self) -> &Logger {
        &self.inner.log
    }

    fn session(&self) -> Result<Arc<dyn Session>> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let mut current = locked(&self.inner.current);
        if let Some(c) = current.as_ref() {
            if c.session.state() == KeeperState::SyncConnected {
                return Ok(Arc::clone(&c.session));
            }
        }

        if let Some(stale) = current.take() {
            debug!(self.inner.log, "discarding stale session";
                "session" => stale.session.id());
            stale.session.close();
        }

        let (generation, session) = self.open_session()?;
        *current = Some(CurrentSession {
            generation,
            session: Arc::clone(&session),
        });
        drop(current);

        if self.inner.connected_once.swap(true, Ordering::SeqCst) {
            info!(self.inner.log, "reconnected to coordinator";
                "session" => session.id());
            let hooks: Vec<ReconnectHook> =
                locked(&self.inner.reconnect_hooks).clone();
            hooks.iter().for_each(|hook| hook());
        }
        Ok(session)
    }

    fn open_session(&self) -> Result<(u64, Arc<dyn Session>)> {
        let generation =
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let watcher: SessionWatcher = Arc::new(move |event: WatchedEvent| {
            if let Some(inner) = weak.upgrade() {
                ZkClient { inner }.process_session_event(generation, event);
            }
        });

        info!(self.inner.log, "connecting to coordinator";
            "connect_string" => self.inner.connect_string.to_string());

        let mut backoff = ExponentialBackoff::default();
        backoff.max_elapsed_time = Some(CONNECT_TIMEOUT);
        let log = self.inner.log.clone();
        let mut op = || {
            if self.is_shutdown() {
                return Err(backoff::Error::Permanent(ZkError::ConnectionLoss));
            }
            self.inner
                .connector
                .connect(
                    &self.inner.connect_string,
                    SESSION_TIMEOUT,
                    Arc::clone(&watcher),
                )
                .map_err(|e| {
                    warn!(log, "retrying coordinator connection: {}", e);
                    backoff::Error::Transient(e)
                })
        };
        let session = op.retry(&mut backoff).map_err(|e| {
            let e = match e {
                backoff::Error::Permanent(e) | backoff::Error::Transient(e) => e,
            };
            if self.is_shutdown() {
                Error::Shutdown
            } else {
                error!(self.inner.log, "giving up connecting: {}", e);
                Error::from(e)
            }
        })?;

        info!(self.inner.log, "waiting for coordinator connection...");
        if !self.inner.latch.wait(generation, CONNECT_TIMEOUT) {
            error!(self.inner.log,
                "waited {} seconds but never finished connecting",
                CONNECT_TIMEOUT.as_secs());
            session.close();
            return Err(Error::ConnectTimeout(CONNECT_TIMEOUT.as_secs()));
        }
        debug!(self.inner.log, "session connected"; "session" => session.id());
        Ok((generation, session))
    }

    fn process_session_event(&self, generation: u64, event: WatchedEvent) {
        trace!(self.inner.log, "session event";
            "generation" => generation,
            "state" => event.keeper_state.to_string());
        match event.keeper_state {
            KeeperState::SyncConnected => self.inner.latch.open(generation),
            KeeperState::Expired | KeeperState::Disconnected => {
                let mut current = locked(&self.inner.current);
                let is_current = current
                    .as_ref()
                    .map(|c| c.generation == generation)
                    .unwrap_or(false);
                if is_current {
                    warn!(self.inner.log,
                        "session {}, forcing reconnect", event.keeper_state);
                    if let Some(c) = current.take() {
                        c.session.close();
                    }
                }
            }
            KeeperState::Closed => (),
        }
    }

    // Drop `session` if it is still the current one so the next call
    // reconnects.
    fn force_reconnect(&self, session: &Arc<dyn Session>) {
        let mut current = locked(&self.inner.current);
        let is_current = current
            .as_ref()
            .map(|c| c.session.id() == session.id())
            .unwrap_or(false);
        if is_current {
            if let Some(c) = current.take() {
                c.session.close();
            }
        }
    }

    fn retry<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&dyn Session) -> ZkResult<T>,
    {
        let mut attempt = 1;
        loop {
            let session = self.session()?;
            match op(session.as_ref()) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_connection_error() => {
                    self.force_reconnect(&session);
                    if attempt >= MAX_RETRY_COUNT {
                        error!(self.inner.log,
                            "{} lost its connection after {} attempts, giving up",
                            what, attempt);
                        return Err(e.into());
                    }
                    warn!(self.inner.log,
                        "{} lost its connection, retrying {} of {} after {:?}",
                        what, attempt, MAX_RETRY_COUNT, RETRY_DELAY);
                    thread::sleep(RETRY_DELAY);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Run `op` once against session `id`. A connection error ends that
    // session, so nothing is retried against its replacement.
    fn in_session<T, F>(&self, id: SessionId, what: &str, op: F) -> Result<T>
    where
        F: FnOnce(&dyn Session) -> ZkResult<T>,
    {
        let session = self.session()?;
        if session.id() != id {
            debug!(self.inner.log, "{} refused, session replaced", what;
                "session" => id, "live" => session.id());
            return Err(Error::SessionReplaced(id));
        }
        match op(session.as_ref()) {
            Err(e) if e.is_connection_error() => {
                warn!(self.inner.log, "{} lost its session: {}", what, e;
                    "session" => id);
                self.force_reconnect(&session);
                Err(Error::SessionReplaced(id))
            }
            result => result.map_err(Error::from),
        }
    }

    fn create_node(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        self.retry("create", |s| s.create(path, data, mode))
    }

    /// Create an empty persistent node.
    pub fn create(&self, path: &str) -> Result<String> {
        self.create_node(path, &[], CreateMode::Persistent)
    }

    pub fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<String> {
        self.create_node(path, data, CreateMode::Ephemeral)
    }

    /// Create a persistent sequential node. The returned path carries the
    /// sequence suffix.
    pub fn create_sequential(&self, path: &str, data: &[u8]) -> Result<String> {
        self.create_node(path, data, CreateMode::PersistentSequential)
    }

    pub fn create_ephemeral_sequential(
        &self,
        path: &str,
        data: &[u8],
    ) -> Result<String> {
        self.create_node(path, data, CreateMode::EphemeralSequential)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.stat(path).map(|s| s.is_some())
    }

    /// Stat a node, arming a one-shot watch that fires when it is created,
    /// deleted or changed.
    pub fn exists_w<W>(&self, path: &str, watcher: W) -> Result<bool>
    where
        W: Fn(WatchedEvent) + Send + Sync + 'static,
    {
        let watcher: SharedWatcher = Arc::new(watcher);
        self.retry("exists", |s| {
            let w = Arc::clone(&watcher);
            s.exists(path, Some(Box::new(move |e| w(e))))
        })
        .map(|s| s.is_some())
    }

    pub fn stat(&self, path: &str) -> Result<Option<Stat>> {
        self.retry("stat", |s| s.exists(path, None))
    }

    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        self.retry("get children", |s| s.get_children(path, None))
    }

    /// List the children of a node, arming a one-shot watch on the list.
    pub fn children_w<W>(&self, path: &str, watcher: W) -> Result<Vec<String>>
    where
        W: Fn(WatchedEvent) + Send + Sync + 'static,
    {
        let watcher: SharedWatcher = Arc::new(watcher);
        self.retry("get children", |s| {
            let w = Arc::clone(&watcher);
            s.get_children(path, Some(Box::new(move |e| w(e))))
        })
    }

    /// The children of `parent` with their stats. Children deleted between
    /// the listing and their stat are left out.
    pub fn children_with_stats(
        &self,
        parent: &str,
    ) -> Result<Vec<(String, Stat)>> {
        let children = self.children(parent)?;
        let mut stats = Vec::with_capacity(children.len());
        for child in children {
            if let Some(stat) = self.stat(&join(parent, &child))? {
                stats.push((child, stat));
            }
        }
        Ok(stats)
    }

    pub fn data(&self, path: &str) -> Result<Vec<u8>> {
        self.retry("get data", |s| s.get_data(path)).map(|(d, _)| d)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.retry("delete", |s| s.delete(path))
    }

    /// Flush the session's view of `path` so later reads observe every
    /// write made before the call.
    pub fn sync(&self, path: &str) -> Result<()> {
        self.retry("sync", |s| s.sync(path))
    }

    /// Start a multi-op transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            client: self,
            ops: Vec::new(),
            session: None,
        }
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// A multi-op transaction under construction. Nothing is sent to the
/// coordinator until `commit`, which applies every op or none.
#[must_use = "a transaction does nothing until it is committed"]
pub struct Transaction<'a> {
    client: &'a ZkClient,
    ops: Vec<Op>,
    session: Option<SessionId>,
}

impl<'a> Transaction<'a> {
    /// Commit only in session `id`. If that session has ended the commit
    /// fails with `Error::SessionReplaced` instead of being retried against
    /// a new one.
    pub fn in_session(mut self, id: SessionId) -> Self {
        self.session = Some(id);
        self
    }

    pub fn create(self, path: &str) -> Self {
        self.create_with_data(path, &[])
    }

    pub fn create_with_data(mut self, path: &str, data: &[u8]) -> Self {
        self.ops.push(Op::Create {
            path: String::from(path),
            data: data.to_vec(),
            mode: CreateMode::Persistent,
        });
        self
    }

    pub fn create_ephemeral(mut self, path: &str) -> Self {
        self.ops.push(Op::Create {
            path: String::from(path),
            data: Vec::new(),
            mode: CreateMode::Ephemeral,
        });
        self
    }

    pub fn delete(mut self, path: &str) -> Self {
        self.ops.push(Op::Delete {
            path: String::from(path),
        });
        self
    }

    /// Delete `path` and everything below it. The subtree is read when this
    /// is called; children added afterwards make the commit fail.
    pub fn delete_recursive(mut self, path: &str) -> Result<Self> {
        let mut deletes = Vec::new();
        collect_subtree(self.client, path, &mut deletes)?;
        self.ops
            .extend(deletes.into_iter().map(|path| Op::Delete { path }));
        Ok(self)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit(self) -> Result<Vec<OpResult>> {
        if self.ops.is_empty() {
            return Ok(Vec::new());
        }
        let ops = self.ops;
        match self.session {
            Some(id) => {
                self.client
                    .in_session(id, "transaction commit", |s| s.multi(&ops))
            }
            None => self.client.retry("transaction commit", |s| s.multi(&ops)),
        }
    }
}

// Children first, then the node itself.
fn collect_subtree(
    client: &ZkClient,
    path: &str,
    deletes: &mut Vec<String>,
) -> Result<()> {
    for child in client.children(path)? {
        collect_subtree(client, &join(path, &child), deletes)?;
    }
    deletes.push(String::from(path));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::str::FromStr;
    use std::sync::mpsc::sync_channel;
    use std::time::Instant;

    use slog::Drain;

    use crate::coordinator::memory::MemoryEnsemble;
    use crate::coordinator::WatchedEventType;

    fn log() -> Logger {
        let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
        Logger::root(
            slog::LevelFilter::new(
                slog_term::FullFormat::new(plain).build(),
                slog::Level::Warning,
            )
            .fuse(),
            o!(),
        )
    }

    fn client(ensemble: &MemoryEnsemble) -> ZkClient {
        ZkClient::new(
            Arc::new(ensemble.clone()),
            ZkConnectString::from_str("127.0.0.1:2181").unwrap(),
            &log(),
        )
    }

    #[test]
    fn transaction_applies_atomically() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.transaction().create("/a").create("/a/b").commit().unwrap();
        assert!(zk.exists("/a/b").unwrap());

        let err = zk
            .transaction()
            .delete("/a/b")
            .create("/a/b/c")
            .commit()
            .unwrap_err();
        assert!(err.is_no_node());
        assert!(zk.exists("/a/b").unwrap());
    }

    #[test]
    fn delete_recursive_removes_subtree_bottom_up() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.transaction()
            .create("/r")
            .create("/r/x")
            .create("/r/x/1")
            .create("/r/y")
            .commit()
            .unwrap();
        let txn = zk.transaction().delete_recursive("/r").unwrap();
        let deletes: Vec<&str> = txn
            .ops()
            .iter()
            .map(|op| match op {
                Op::Delete { path } => path.as_str(),
                Op::Create { path, .. } => path.as_str(),
            })
            .collect();
        assert_eq!(deletes, vec!["/r/x/1", "/r/x", "/r/y", "/r"]);
        txn.commit().unwrap();
        assert!(ensemble.dump().is_empty());
    }

    #[test]
    fn children_watch_fires_once() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.create("/w").unwrap();
        let (tx, rx) = sync_channel(4);
        zk.children_w("/w", move |e| {
            let _ = tx.try_send(e.event_type);
        })
        .unwrap();
        zk.create("/w/1").unwrap();
        zk.create("/w/2").unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WatchedEventType::NodeChildrenChanged
        );
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn expired_session_is_replaced_and_hooks_run() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.connect().unwrap();
        let first = zk.session_id().unwrap();

        let (tx, rx) = sync_channel(1);
        zk.on_reconnect(move || {
            let _ = tx.try_send(());
        });

        ensemble.expire_session(first);
        zk.create("/after-expiry").unwrap();
        let second = zk.session_id().unwrap();
        assert_ne!(first, second);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn pinned_transaction_refuses_replaced_session() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.create("/p").unwrap();
        let first = zk.ensure_session().unwrap();
        zk.transaction()
            .in_session(first)
            .create_ephemeral("/p/mine")
            .commit()
            .unwrap();

        ensemble.expire_session(first);
        let result = zk
            .transaction()
            .in_session(first)
            .create("/p/late")
            .commit();
        assert!(matches!(result, Err(Error::SessionReplaced(id)) if id == first));
        assert!(!zk.exists("/p/late").unwrap());
        assert!(!zk.exists("/p/mine").unwrap());
        assert_ne!(zk.session_id(), Some(first));
    }

    #[test]
    fn operations_ride_out_a_short_outage() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.connect().unwrap();
        ensemble.set_reachable(false);
        let healer = ensemble.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            healer.set_reachable(true);
        });
        let start = Instant::now();
        zk.create("/healed").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
        t.join().unwrap();
    }

    #[test]
    fn shutdown_refuses_work() {
        let ensemble = MemoryEnsemble::default();
        let zk = client(&ensemble);
        zk.create("/e").unwrap();
        zk.shutdown();
        assert!(zk.is_shutdown());
        assert!(matches!(zk.exists("/e"), Err(Error::Shutdown)));
        assert!(ensemble.sessions().is_empty());
    }
}
