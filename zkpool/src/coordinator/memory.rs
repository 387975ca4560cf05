// Copyright 2020 Joyent, Inc.

//! An in-process coordinator ensemble.
//!
//! `MemoryEnsemble` keeps a single node tree shared by every session it hands
//! out, with the semantics the pool relies on from a real ensemble:
//! ephemeral nodes owned by sessions, per-parent sequence counters, one-shot
//! watches and all-or-nothing multi-op transactions. Watch callbacks for a
//! session run in order on that session's own event thread, never while the
//! tree is locked, so callbacks are free to issue further requests.
//!
//! Sessions can be expired on demand with
//! [`expire_session`](struct.MemoryEnsemble.html#method.expire_session),
//! which is how a participant crash is simulated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use slog::{debug, info, o, trace, Drain, Logger};

use crate::config::ZkConnectString;
use crate::coordinator::{
    Connector, CreateMode, KeeperState, Op, OpResult, Session, SessionId,
    SessionWatcher, Stat, WatchedEvent, WatchedEventType, Watcher, ZkError,
    ZkResult,
};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug)]
struct Znode {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
    next_seq: u64,
}

// The part of the ensemble state that multi-op transactions stage and swap.
#[derive(Clone, Debug)]
struct Tree {
    nodes: BTreeMap<String, Znode>,
    zxid: u64,
}

enum Change {
    Created(String),
    Deleted(String),
}

struct SessionEntry {
    events: Sender<Job>,
    watcher: SessionWatcher,
}

struct EnsembleState {
    tree: Tree,
    sessions: HashMap<SessionId, SessionEntry>,
    child_watches: HashMap<String, Vec<(SessionId, Watcher)>>,
    node_watches: HashMap<String, Vec<(SessionId, Watcher)>>,
}

struct EnsembleInner {
    state: Mutex<EnsembleState>,
    next_session: AtomicU64,
    reachable: AtomicBool,
    log: Logger,
}

/// A coordinator ensemble living inside the current process.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MemoryEnsemble {
    pub fn new(log: Option<Logger>) -> Self {
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("component" => "memory-ensemble"));

        let mut nodes = BTreeMap::new();
        nodes.insert(String::from("/"), new_znode(Vec::new(), 0, None));

        MemoryEnsemble {
            inner: Arc::new(EnsembleInner {
                state: Mutex::new(EnsembleState {
                    tree: Tree { nodes, zxid: 0 },
                    sessions: HashMap::new(),
                    child_watches: HashMap::new(),
                    node_watches: HashMap::new(),
                }),
                next_session: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                log,
            }),
        }
    }

    /// Expire a session as the ensemble would after its owner stopped
    /// heartbeating: its ephemeral nodes are removed, its pending watches are
    /// discarded and its session watcher observes `Expired`.
    pub fn expire_session(&self, id: SessionId) {
        info!(self.inner.log, "expiring session"; "session" => id);
        self.inner.end_session(id, Some(KeeperState::Expired));
    }

    /// Make the ensemble unreachable (or reachable again). While unreachable
    /// new connections and requests on existing sessions fail with
    /// `ConnectionLoss`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every node path in the tree except the root, in order.
    pub fn dump(&self) -> Vec<String> {
        let state = self.inner.lock();
        state
            .tree
            .nodes
            .keys()
            .filter(|p| p.as_str() != "/")
            .cloned()
            .collect()
    }

    /// Ids of the sessions currently alive.
    pub fn sessions(&self) -> Vec<SessionId> {
        let state = self.inner.lock();
        let mut ids: Vec<SessionId> = state.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        MemoryEnsemble::new(None)
    }
}

impl Connector for MemoryEnsemble {
    fn connect(
        &self,
        connect_string: &ZkConnectString,
        _session_timeout: Duration,
        watcher: SessionWatcher,
    ) -> ZkResult<Arc<dyn Session>> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(ZkError::ConnectionLoss);
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = channel::<Job>();

        thread::Builder::new()
            .name(format!("zk-session-{}", id))
            .spawn(move || {
                for job in events_rx.iter() {
                    job();
                }
            })
            .map_err(|e| ZkError::BadArguments(e.to_string()))?;

        let mut state = self.inner.lock();
        let connected = Arc::clone(&watcher);
        let _ = events_tx.send(Box::new(move || {
            connected(WatchedEvent::session(KeeperState::SyncConnected))
        }));
        state.sessions.insert(
            id,
            SessionEntry {
                events: events_tx,
                watcher,
            },
        );
        drop(state);

        debug!(self.inner.log, "session established";
            "session" => id,
            "connect_string" => connect_string.to_string());

        Ok(Arc::new(MemorySession {
            id,
            ensemble: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySession {
    id: SessionId,
    ensemble: Arc<EnsembleInner>,
}

impl EnsembleInner {
    fn lock(&self) -> MutexGuard<EnsembleState> {
        // A panicking watcher never runs under this lock, so poisoning can
        // only come from a bug in this module; keep serving the tree.
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // Lock the ensemble on behalf of a live, reachable session.
    fn session_lock(&self, id: SessionId) -> ZkResult<MutexGuard<EnsembleState>> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ZkError::ConnectionLoss);
        }
        let state = self.lock();
        if !state.sessions.contains_key(&id) {
            return Err(ZkError::SessionExpired);
        }
        Ok(state)
    }

    fn end_session(&self, id: SessionId, notify: Option<KeeperState>) {
        let mut state = self.lock();
        let entry = match state.sessions.remove(&id) {
            Some(entry) => entry,
            None => return,
        };

        // Watch closures may own handles that reach back into the ensemble,
        // so they are dropped only after the lock is released.
        let mut discarded: Vec<Watcher> = Vec::new();
        let st = &mut *state;
        for watches in st
            .child_watches
            .values_mut()
            .chain(st.node_watches.values_mut())
        {
            for (owner, w) in std::mem::take(watches) {
                if owner == id {
                    discarded.push(w);
                } else {
                    watches.push((owner, w));
                }
            }
        }

        let mut ephemerals: Vec<String> = state
            .tree
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        // Deepest first, although ephemerals never have children.
        ephemerals.sort_by(|a, b| b.len().cmp(&a.len()));

        let mut changes = Vec::with_capacity(ephemerals.len());
        for path in ephemerals {
            if delete_node(&mut state.tree, &path).is_ok() {
                changes.push(Change::Deleted(path));
            }
        }
        trace!(self.log, "removed ephemeral nodes";
            "session" => id, "count" => changes.len());
        fire(&mut state, changes);

        if let Some(keeper_state) = notify {
            let watcher = Arc::clone(&entry.watcher);
            let _ = entry.events.send(Box::new(move || {
                watcher(WatchedEvent::session(keeper_state))
            }));
        }
        drop(state);
        drop(discarded);
        // Dropping the sender lets the event thread drain and exit.
        drop(entry);
    }
}

impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> KeeperState {
        if !self.ensemble.reachable.load(Ordering::SeqCst) {
            return KeeperState::Disconnected;
        }
        let state = self.ensemble.lock();
        if state.sessions.contains_key(&self.id) {
            KeeperState::SyncConnected
        } else {
            KeeperState::Closed
        }
    }

    fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> ZkResult<String> {
        let mut state = self.ensemble.session_lock(self.id)?;
        let created = create_node(&mut state.tree, path, data, mode, self.id)?;
        fire(&mut state, vec![Change::Created(created.clone())]);
        Ok(created)
    }

    fn delete(&self, path: &str) -> ZkResult<()> {
        let mut state = self.ensemble.session_lock(self.id)?;
        delete_node(&mut state.tree, path)?;
        fire(&mut state, vec![Change::Deleted(String::from(path))]);
        Ok(())
    }

    fn exists(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> ZkResult<Option<Stat>> {
        let mut state = self.ensemble.session_lock(self.id)?;
        let stat = state.tree.nodes.get(path).map(|n| n.stat);
        if let Some(w) = watcher {
            state
                .node_watches
                .entry(String::from(path))
                .or_insert_with(Vec::new)
                .push((self.id, w));
        }
        Ok(stat)
    }

    fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> ZkResult<Vec<String>> {
        let mut state = self.ensemble.session_lock(self.id)?;
        let children: Vec<String> = match state.tree.nodes.get(path) {
            Some(node) => node.children.iter().cloned().collect(),
            None => return Err(ZkError::NoNode(String::from(path))),
        };
        if let Some(w) = watcher {
            state
                .child_watches
                .entry(String::from(path))
                .or_insert_with(Vec::new)
                .push((self.id, w));
        }
        Ok(children)
    }

    fn get_data(&self, path: &str) -> ZkResult<(Vec<u8>, Stat)> {
        let state = self.ensemble.session_lock(self.id)?;
        state
            .tree
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.stat))
            .ok_or_else(|| ZkError::NoNode(String::from(path)))
    }

    fn multi(&self, ops: &[Op]) -> ZkResult<Vec<OpResult>> {
        let mut state = self.ensemble.session_lock(self.id)?;
        let mut staged = state.tree.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut changes = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                Op::Create { path, data, mode } => {
                    let created =
                        create_node(&mut staged, path, data, *mode, self.id)?;
                    changes.push(Change::Created(created.clone()));
                    results.push(OpResult::Created(created));
                }
                Op::Delete { path } => {
                    delete_node(&mut staged, path)?;
                    changes.push(Change::Deleted(path.clone()));
                    results.push(OpResult::Deleted);
                }
            }
        }

        state.tree = staged;
        fire(&mut state, changes);
        Ok(results)
    }

    fn sync(&self, _path: &str) -> ZkResult<()> {
        // A single tree is always current.
        self.ensemble.session_lock(self.id).map(|_| ())
    }

    fn close(&self) {
        self.ensemble.end_session(self.id, None);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.ensemble.end_session(self.id, None);
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_znode(data: Vec<u8>, zxid: u64, owner: Option<SessionId>) -> Znode {
    let now = now_millis();
    Znode {
        data,
        stat: Stat {
            czxid: zxid,
            ctime: now,
            mtime: now,
            version: 0,
            num_children: 0,
            ephemeral_owner: owner,
        },
        children: BTreeSet::new(),
        next_seq: 0,
    }
}

fn split_path(path: &str) -> ZkResult<(&str, &str)> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(ZkError::BadArguments(format!("invalid path {}", path)));
    }
    let idx = path.rfind('/').unwrap_or(0);
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Ok((parent, &path[idx + 1..]))
}

fn create_node(
    tree: &mut Tree,
    path: &str,
    data: &[u8],
    mode: CreateMode,
    session: SessionId,
) -> ZkResult<String> {
    let (parent_path, name) = split_path(path)?;
    if name.is_empty() && !mode.is_sequential() {
        return Err(ZkError::BadArguments(format!("invalid path {}", path)));
    }

    let parent = tree
        .nodes
        .get_mut(parent_path)
        .ok_or_else(|| ZkError::NoNode(String::from(parent_path)))?;
    if parent.stat.ephemeral_owner.is_some() {
        return Err(ZkError::NoChildrenForEphemerals(String::from(
            parent_path,
        )));
    }

    let (full_path, child_name) = if mode.is_sequential() {
        let seq = parent.next_seq;
        let child_name = format!("{}{:010}", name, seq);
        (format!("{}{:010}", path, seq), child_name)
    } else {
        (String::from(path), String::from(name))
    };

    if parent.children.contains(&child_name) {
        return Err(ZkError::NodeExists(full_path));
    }
    if mode.is_sequential() {
        parent.next_seq += 1;
    }
    parent.children.insert(child_name);
    parent.stat.num_children = parent.children.len();

    tree.zxid += 1;
    let owner = if mode.is_ephemeral() { Some(session) } else { None };
    tree.nodes
        .insert(full_path.clone(), new_znode(data.to_vec(), tree.zxid, owner));
    Ok(full_path)
}

fn delete_node(tree: &mut Tree, path: &str) -> ZkResult<()> {
    let (parent_path, name) = split_path(path)?;
    match tree.nodes.get(path) {
        None => return Err(ZkError::NoNode(String::from(path))),
        Some(node) if !node.children.is_empty() => {
            return Err(ZkError::NotEmpty(String::from(path)))
        }
        Some(_) => {}
    }
    tree.nodes.remove(path);
    if let Some(parent) = tree.nodes.get_mut(parent_path) {
        parent.children.remove(name);
        parent.stat.num_children = parent.children.len();
    }
    tree.zxid += 1;
    Ok(())
}

// Queue the watches triggered by `changes` onto their sessions' event
// threads.
fn fire(state: &mut EnsembleState, changes: Vec<Change>) {
    let mut triggered: Vec<(SessionId, Watcher, WatchedEvent)> = Vec::new();

    let event = |event_type, path: &str| WatchedEvent {
        event_type,
        keeper_state: KeeperState::SyncConnected,
        path: Some(String::from(path)),
    };

    for change in changes {
        let (path, node_event) = match &change {
            Change::Created(p) => (p.as_str(), WatchedEventType::NodeCreated),
            Change::Deleted(p) => (p.as_str(), WatchedEventType::NodeDeleted),
        };

        if let Some(watches) = state.node_watches.remove(path) {
            for (owner, w) in watches {
                triggered.push((owner, w, event(node_event, path)));
            }
        }
        if let Change::Deleted(_) = change {
            if let Some(watches) = state.child_watches.remove(path) {
                for (owner, w) in watches {
                    triggered.push((
                        owner,
                        w,
                        event(WatchedEventType::NodeDeleted, path),
                    ));
                }
            }
        }
        if let Ok((parent, _)) = split_path(path) {
            if let Some(watches) = state.child_watches.remove(parent) {
                for (owner, w) in watches {
                    triggered.push((
                        owner,
                        w,
                        event(WatchedEventType::NodeChildrenChanged, parent),
                    ));
                }
            }
        }
    }

    for (owner, watcher, event) in triggered {
        if let Some(entry) = state.sessions.get(&owner) {
            let _ = entry.events.send(Box::new(move || watcher(event)));
        }
    }
}
