// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use rand::Rng;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};

use crate::config::{PoolConfig, PoolOptions};
use crate::coordinator::{Connector, SessionId, ZkError};
use crate::error::{Error, Result};
use crate::factory::{FactoryError, ObjectFactory};
use crate::metrics::{MetricsTracker, PoolCounts, PoolMetrics};
use crate::net;
use crate::object_pool::types::{PoolState, PooledObject};
use crate::paths::{ObjectId, PoolPaths};
use crate::tasks::crash_detector::CrashDetector;
use crate::tasks::metrics_reporter::MetricsReporter;
use crate::tasks::{eviction, zombie, TaskManager};
use crate::zk_client::{ZkClient, MAX_RETRY_COUNT};

// Share of the used count that bounds the random pick among unused objects
const SELECTION_WINDOW: f64 = 0.4;
// Payload of a participant node that carries no address
const ADDRESS_UNKNOWN: &str = "address-unknown";

fn locked<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// Where `add_new` files a freshly created object. A used marker is
// ephemeral and belongs to the given session.
#[derive(Copy, Clone, Debug)]
enum Bucket {
    Unused,
    Used(SessionId),
}

/// Outcome of borrowing one particular object.
pub(crate) enum Claim<T> {
    Borrowed(PooledObject<T>),
    /// The object failed validation or could not be read and is gone.
    Removed,
    /// Someone else holds it, it is a zombie, or borrowing failed.
    Unavailable,
}

// An object this participant has borrowed. Its used marker was created by
// `session` and disappears with it.
#[derive(Copy, Clone, Debug)]
struct Loan {
    session: SessionId,
    since: Instant,
}

/// A pool of objects shared by every participant that uses the same pool
/// name against the same coordinator ensemble.
pub struct ZkObjectPool<F>
where
    F: ObjectFactory,
{
    inner: Arc<PoolInner<F>>,
    tasks: Mutex<Option<TaskManager>>,
}

impl<F> Debug for ZkObjectPool<F>
where
    F: ObjectFactory,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ZkObjectPool")
            .field("name", &self.inner.config.name)
            .field("state", &self.inner.state())
            .field("participant", &*locked(&self.inner.participant))
            .finish()
    }
}

// The state shared between the pool handle and its supervisors.
#[doc(hidden)]
pub struct PoolInner<F>
where
    F: ObjectFactory,
{
    pub config: PoolConfig,
    pub paths: PoolPaths,
    pub zk: ZkClient,
    pub log: Logger,
    pub(crate) metrics: MetricsTracker,
    factory: RwLock<Arc<F>>,
    borrowed: Mutex<HashMap<ObjectId, Loan>>,
    participant: Mutex<Option<String>>,
    address: String,
    shutdown: AtomicBool,
    state: Mutex<PoolState>,
}

impl<F> ZkObjectPool<F>
where
    F: ObjectFactory,
{
    pub fn new<C>(options: PoolOptions, connector: C, factory: F) -> Self
    where
        C: Connector,
    {
        let config = PoolConfig::resolve(&options);

        let logger = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => config.name.clone()));

        let zk = ZkClient::new(
            Arc::new(connector),
            config.connect_string.clone(),
            &logger,
        );

        let address = config
            .participant_address
            .clone()
            .unwrap_or_else(|| net::local_address().to_string());

        let inner = Arc::new(PoolInner {
            paths: PoolPaths::new(&config.name),
            config,
            zk,
            log: logger,
            metrics: MetricsTracker::new(),
            factory: RwLock::new(Arc::new(factory)),
            borrowed: Mutex::new(HashMap::new()),
            participant: Mutex::new(None),
            address,
            shutdown: AtomicBool::new(false),
            state: Mutex::new(PoolState::Created),
        });

        let weak = Arc::downgrade(&inner);
        inner.zk.on_reconnect(move || {
            if let Some(inner) = weak.upgrade() {
                inner.forget_stale_loans();
            }
        });

        ZkObjectPool {
            inner,
            tasks: Mutex::new(None),
        }
    }

    /// Join the pool. The first participant to initialize a pool creates its
    /// coordinator paths and fills it with `init_size` objects; everyone
    /// else finds the paths in place and simply registers. The background
    /// supervisors start once this participant is registered.
    pub fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state();
        if state != PoolState::Created {
            return Err(Error::NotRunning(state.to_string()));
        }
        inner.config.validate()?;

        info!(inner.log, "initializing pool";
            "size" => inner.config.size,
            "init_size" => inner.config.init_size);

        inner.zk.connect()?;
        if inner.construct_paths()? {
            info!(inner.log,
                "constructed pool paths, filling pool to its initial capacity");
            inner.fill()?;
        }
        inner.register_participant()?;
        inner.zk.sync(inner.paths.used())?;
        inner.set_state(PoolState::Running);

        let mut tasks = TaskManager::new(&inner.log);
        tasks.add(Box::new(CrashDetector::new(Arc::clone(inner))));
        if let Some(task) = eviction::task(Arc::clone(inner)) {
            tasks.add(Box::new(task));
        }
        if let Some(task) = zombie::task(Arc::clone(inner)) {
            tasks.add(Box::new(task));
        }
        if let Some(task) = MetricsReporter::new(Arc::clone(inner)) {
            tasks.add(Box::new(task));
        }
        let started = tasks.start();
        *locked(&self.tasks) = Some(tasks);
        started
    }

    /// Borrow an object. Returns `None` when the pool is at capacity, when
    /// it is not running, or when borrowing failed; failures are logged.
    pub fn borrow(&self) -> Option<PooledObject<F::Object>> {
        self.inner.borrow()
    }

    /// Hand a borrowed object back to the pool.
    pub fn return_object(&self, obj: PooledObject<F::Object>) {
        self.inner.return_object(obj)
    }

    /// Destroy a borrowed object and remove it from the pool. Returns
    /// whether the factory destroyed it. If the factory reports the object
    /// as a zombie it is parked for the reconciler instead; any other
    /// failure leaves it marked as used.
    pub fn invalidate(&self, obj: PooledObject<F::Object>) -> bool {
        self.inner.invalidate(obj)
    }

    /// Borrow the object with the given id if it is currently unused.
    pub fn borrow_specific(
        &self,
        id: &ObjectId,
    ) -> Option<PooledObject<F::Object>> {
        self.inner.borrow_specific(id)
    }

    /// Leave the pool. The supervisors are stopped and this participant
    /// deregisters; if it was the last participant every object is destroyed
    /// and the pool's coordinator paths are removed. Calling this more than
    /// once has no further effect.
    pub fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let prior = inner.state();
        inner.set_state(PoolState::Stopping);

        if prior == PoolState::Created {
            inner.zk.shutdown();
            inner.set_state(PoolState::Stopped);
            return Ok(());
        }

        info!(inner.log, "shutting down pool");
        let tasks = locked(&self.tasks).take();
        let result =
            inner.zk.do_synchronized(inner.paths.shutdown_lock(), || {
                if let Some(tasks) = tasks {
                    tasks.shutdown();
                }
                info!(inner.log, "deregistering participant");
                inner.deregister();
                let participants_left = match inner.participants() {
                    Ok(p) => p.len(),
                    Err(e) => {
                        // Assume company so nothing is destroyed under it.
                        warn!(inner.log, "unable to count participants: {}", e);
                        1
                    }
                };
                if let Err(e) = inner.release_all(participants_left) {
                    error!(inner.log, "error releasing objects: {}", e);
                }
                Ok(participants_left)
            });
        inner.zk.shutdown();
        inner.set_state(PoolState::Stopped);

        match result {
            Ok(left) => {
                info!(inner.log, "pool shut down"; "participants_left" => left);
                Ok(())
            }
            Err(e) => {
                error!(inner.log, "error shutting down pool: {}", e);
                Err(e)
            }
        }
    }

    /// Replace the factory used for subsequent operations.
    pub fn set_factory(&self, factory: F) {
        self.inner.set_factory(factory)
    }

    pub fn factory(&self) -> Arc<F> {
        self.inner.factory()
    }

    /// Total number of objects in the pool.
    pub fn size(&self) -> Result<usize> {
        self.inner.child_count(self.inner.paths.master())
    }

    pub fn unused(&self) -> Result<usize> {
        self.inner.child_count(self.inner.paths.unused())
    }

    pub fn used(&self) -> Result<usize> {
        self.inner.used_count()
    }

    pub fn zombies(&self) -> Result<usize> {
        self.inner.child_count(self.inner.paths.zombies())
    }

    /// The advertised addresses of every registered participant.
    pub fn participants(&self) -> Result<Vec<String>> {
        self.inner.participants()
    }

    /// The name of this participant's registration node, if registered.
    pub fn participant_id(&self) -> Option<String> {
        locked(&self.inner.participant).clone()
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Number of objects this participant currently has borrowed.
    pub fn borrowed(&self) -> usize {
        locked(&self.inner.borrowed).len()
    }

    pub fn metrics(&self) -> Result<PoolMetrics> {
        self.inner.metrics_snapshot()
    }

    pub fn paths(&self) -> &PoolPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn zk(&self) -> &ZkClient {
        &self.inner.zk
    }
}

impl<F> Drop for ZkObjectPool<F>
where
    F: ObjectFactory,
{
    // A pool dropped without `shutdown` stops its supervisors and closes its
    // session; the rest of the pool sees this participant as crashed.
    fn drop(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tasks) = locked(&self.tasks).take() {
            warn!(self.inner.log, "pool dropped without shutdown");
            tasks.shutdown();
        }
        self.inner.zk.shutdown();
        self.inner.set_state(PoolState::Stopped);
    }
}

impl<F> PoolInner<F>
where
    F: ObjectFactory,
{
    pub fn state(&self) -> PoolState {
        *locked(&self.state)
    }

    fn set_state(&self, state: PoolState) {
        *locked(&self.state) = state;
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
            && self.state() == PoolState::Running
    }

    pub fn factory(&self) -> Arc<F> {
        Arc::clone(&self.factory.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_factory(&self, factory: F) {
        *self.factory.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(factory);
    }

    pub fn child_count(&self, path: &str) -> Result<usize> {
        self.zk
            .stat(path)?
            .map(|s| s.num_children)
            .ok_or_else(|| ZkError::NoNode(String::from(path)).into())
    }

    pub fn used_count(&self) -> Result<usize> {
        self.child_count(self.paths.used())
    }

    fn is_full(&self) -> Result<bool> {
        Ok(self.used_count()? >= self.config.size)
    }

    pub fn participants(&self) -> Result<Vec<String>> {
        let mut addresses = Vec::new();
        for p in self.zk.children(self.paths.participants())? {
            match self.zk.data(&self.paths.participant_node(&p)) {
                Ok(data) if data.is_empty() => {
                    addresses.push(String::from(ADDRESS_UNKNOWN))
                }
                Ok(data) => {
                    addresses.push(String::from_utf8_lossy(&data).into_owned())
                }
                // Left between the listing and the read.
                Err(ref e) if e.is_no_node() => (),
                Err(e) => return Err(e),
            }
        }
        Ok(addresses)
    }

    pub fn metrics_snapshot(&self) -> Result<PoolMetrics> {
        let counts = PoolCounts {
            size: self.child_count(self.paths.master())?,
            unused: self.child_count(self.paths.unused())?,
            used: self.used_count()?,
            zombies: self.child_count(self.paths.zombies())?,
            participants: self.child_count(self.paths.participants())?,
        };
        Ok(self.metrics.get_metrics(counts, self.config.size))
    }

    // Create the whole path schema in one transaction. Returns false when
    // another participant already did.
    fn construct_paths(&self) -> Result<bool> {
        let txn = self
            .paths
            .all()
            .into_iter()
            .fold(self.zk.transaction(), |txn, path| txn.create(path));
        match txn.commit() {
            Ok(_) => Ok(true),
            Err(ref e) if e.is_node_exists() => {
                debug!(self.log, "pool paths already exist, skipping fill");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn fill(&self) -> Result<()> {
        for _ in 0..self.config.init_size {
            self.add_new(Bucket::Unused)?;
        }
        Ok(())
    }

    pub(crate) fn register_participant(&self) -> Result<()> {
        let mut participant = locked(&self.participant);
        if let Some(id) = participant.as_ref() {
            if self.zk.exists(&self.paths.participant_node(id))? {
                return Ok(());
            }
            info!(self.log, "registration lost, registering again";
                "participant" => id);
        }
        let path = self.zk.create_ephemeral_sequential(
            &self.paths.participant_prefix(),
            self.address.as_bytes(),
        )?;
        let id = ObjectId::from_path(&path).to_string();
        info!(self.log, "registered participant";
            "participant" => &id, "address" => &self.address);
        *participant = Some(id);
        Ok(())
    }

    fn deregister(&self) {
        let participant = locked(&self.participant).take();
        if let Some(id) = participant {
            match self.zk.delete(&self.paths.participant_node(&id)) {
                Ok(()) => (),
                Err(ref e) if e.is_no_node() => {
                    debug!(self.log, "participant node already gone")
                }
                Err(e) => warn!(self.log, "failed to deregister: {}", e),
            }
        }
    }

    pub fn borrow(&self) -> Option<PooledObject<F::Object>> {
        if !self.is_running() {
            return None;
        }
        match self.try_borrow() {
            Ok(Some(obj)) => {
                MetricsTracker::incr(&self.metrics.borrowed);
                Some(obj)
            }
            Ok(None) => None,
            Err(e) => {
                error!(self.log, "borrow failed: {}", e);
                None
            }
        }
    }

    fn try_borrow(&self) -> Result<Option<PooledObject<F::Object>>> {
        let mut zombie_hits = 0;
        let mut sessions_lost = 0;
        'borrow: loop {
            if self.shutdown.load(Ordering::SeqCst) || self.is_full()? {
                return Ok(None);
            }
            if zombie_hits >= self.config.size {
                warn!(self.log, "giving up borrow after {} zombies", zombie_hits);
                return Ok(None);
            }
            self.register_participant()?;
            let session = self.zk.ensure_session()?;

            loop {
                let id = match self.find(session) {
                    Ok(Some(id)) => id,
                    Ok(None) => return Ok(None),
                    Err(Error::SessionReplaced(_))
                        if sessions_lost < MAX_RETRY_COUNT =>
                    {
                        sessions_lost += 1;
                        continue 'borrow;
                    }
                    Err(e) => return Err(e),
                };
                let obj = match self.mark_borrowed(&id, session) {
                    Ok(obj) => obj,
                    Err(Error::Factory(e)) => {
                        warn!(self.log, "discarding unreadable object {}: {}",
                            id, e);
                        self.purge(&id, session);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                match self.factory().validate(&obj) {
                    Ok(true) => return Ok(Some(PooledObject::new(id, obj))),
                    Ok(false) => {
                        debug!(self.log, "object {} failed validation", id);
                        self.invalidate(PooledObject::new(id, obj));
                    }
                    Err(FactoryError::Zombie(msg)) => {
                        warn!(self.log, "object {} is a zombie: {}", id, msg);
                        self.unborrow(&id);
                        self.handle_zombie(&id)?;
                        zombie_hits += 1;
                        continue 'borrow;
                    }
                    Err(e) => {
                        debug!(self.log,
                            "error validating object {}, destroying: {}", id, e);
                        self.invalidate(PooledObject::new(id, obj));
                    }
                }
            }
        }
    }

    // Move an unused object to used, or create a new used one if there is
    // none and the pool has room. Gives the object back if that took the
    // pool over capacity.
    fn find(&self, session: SessionId) -> Result<Option<ObjectId>> {
        let id = match self.find_unused(session)? {
            Some(id) => id,
            None if self.is_full()? => return Ok(None),
            None => self.add_new(Bucket::Used(session))?,
        };
        if self.used_count()? > self.config.size {
            // Other participants borrowed at the same time.
            debug!(self.log, "pool over capacity, releasing object {}", id);
            self.mark_unused(&id, session)?;
            return Ok(None);
        }
        Ok(Some(id))
    }

    fn find_unused(&self, session: SessionId) -> Result<Option<ObjectId>> {
        let mut rng = rand::thread_rng();
        loop {
            let mut unused: Vec<ObjectId> = self
                .zk
                .children(self.paths.unused())?
                .into_iter()
                .map(ObjectId::from)
                .collect();
            if unused.is_empty() {
                return Ok(None);
            }
            unused.sort();

            let idx = select_index(self.used_count()?, unused.len(), &mut rng);
            let id = &unused[idx];
            let won = self.mark_used(id, session)?;
            self.metrics.record_hit_or_miss(won);
            if won {
                return Ok(Some(id.clone()));
            }
        }
    }

    // unused -> used. Losing the race for the object is not an error.
    fn mark_used(&self, id: &ObjectId, session: SessionId) -> Result<bool> {
        let result = self
            .zk
            .transaction()
            .in_session(session)
            .delete(&self.paths.unused_node(id))
            .create_ephemeral(&self.paths.used_node(id))
            .commit();
        match result {
            Ok(_) => Ok(true),
            Err(ref e) if e.is_no_node() || e.is_node_exists() => {
                trace!(self.log, "lost race for object {}", id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // used -> unused, for a used marker created by `session`. Once that
    // session has ended the marker is gone and the id may be held by
    // someone else, so nothing is touched.
    fn mark_unused(&self, id: &ObjectId, session: SessionId) -> Result<()> {
        self.zk
            .transaction()
            .in_session(session)
            .delete(&self.paths.used_node(id))
            .create(&self.paths.unused_node(id))
            .commit()
            .map(|_| ())
    }

    // Not a transaction: a crash between the two creates leaves an orphan
    // under master, which the crash detector files under unused.
    fn add_new(&self, bucket: Bucket) -> Result<ObjectId> {
        let factory = self.factory();
        let obj = factory.create()?;
        let data = factory.serialize(&obj)?;
        drop(obj);

        let path = self
            .zk
            .create_sequential(&self.paths.master_prefix(), &data)?;
        let id = ObjectId::from_path(&path);
        match bucket {
            Bucket::Unused => {
                self.zk.create(&self.paths.unused_node(&id))?;
            }
            Bucket::Used(session) => {
                let marked = self
                    .zk
                    .transaction()
                    .in_session(session)
                    .create_ephemeral(&self.paths.used_node(&id))
                    .commit();
                if let Err(e) = marked {
                    // Leave the new object where the next borrower finds it.
                    if let Err(e) = self.zk.create(&self.paths.unused_node(&id)) {
                        warn!(self.log, "object {} left without a bucket: {}",
                            id, e);
                    }
                    return Err(e);
                }
            }
        }
        MetricsTracker::incr(&self.metrics.created);
        debug!(self.log, "created object {} ({:?})", id, bucket);
        Ok(id)
    }

    pub(crate) fn load(&self, id: &ObjectId) -> Result<F::Object> {
        let data = self.zk.data(&self.paths.master_node(id))?;
        Ok(self.factory().deserialize(&data)?)
    }

    fn mark_borrowed(
        &self,
        id: &ObjectId,
        session: SessionId,
    ) -> Result<F::Object> {
        let obj = self.load(id)?;
        let loan = Loan {
            session,
            since: Instant::now(),
        };
        locked(&self.borrowed).insert(id.clone(), loan);
        Ok(obj)
    }

    fn unborrow(&self, id: &ObjectId) -> Option<Loan> {
        locked(&self.borrowed).remove(id)
    }

    // True while the session that took `loan` is still the live one.
    fn loan_is_live(&self, loan: &Loan) -> bool {
        match self.zk.ensure_session() {
            Ok(session) => session == loan.session,
            Err(e) => {
                warn!(self.log, "unable to check session: {}", e);
                false
            }
        }
    }

    // Loans made under an earlier session are void: their used markers
    // went with it and the crash detector has filed the ids under unused.
    fn forget_stale_loans(&self) {
        let live = self.zk.session_id();
        let mut borrowed = locked(&self.borrowed);
        let before = borrowed.len();
        borrowed.retain(|_, loan| Some(loan.session) == live);
        let forgotten = before - borrowed.len();
        if forgotten > 0 {
            warn!(self.log,
                "session replaced, forgetting {} borrowed objects", forgotten);
        }
    }

    fn handle_zombie(&self, id: &ObjectId) -> Result<()> {
        match self.zk.create(&self.paths.zombie_node(id)) {
            Ok(_) => {
                MetricsTracker::incr(&self.metrics.zombies_marked);
                Ok(())
            }
            Err(ref e) if e.is_node_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // Remove an object whose payload cannot be used from master and used.
    fn purge(&self, id: &ObjectId, session: SessionId) {
        self.unborrow(id);
        let result = self
            .zk
            .transaction()
            .in_session(session)
            .delete(&self.paths.master_node(id))
            .delete(&self.paths.used_node(id))
            .commit();
        if let Err(e) = result {
            error!(self.log, "failed to purge object {}: {}", id, e);
        }
    }

    pub fn return_object(&self, obj: PooledObject<F::Object>) {
        let (id, _object) = obj.into_parts();
        let loan = match self.unborrow(&id) {
            Some(loan) => loan,
            None => {
                error!(self.log, "object {} is not on loan here, ignoring return",
                    id);
                return;
            }
        };
        match self.mark_unused(&id, loan.session) {
            Ok(()) => {
                trace!(self.log, "returned object {}", id;
                    "held_ms" => loan.since.elapsed().as_millis() as u64);
                MetricsTracker::incr(&self.metrics.returned);
            }
            Err(Error::SessionReplaced(_)) => {
                warn!(self.log,
                    "object {} was borrowed by an ended session, dropping it", id)
            }
            Err(e) => error!(self.log, "failed to return object {}: {}", id, e),
        }
    }

    pub fn invalidate(&self, obj: PooledObject<F::Object>) -> bool {
        let (id, object) = obj.into_parts();
        let loan = match self.unborrow(&id) {
            Some(loan) => loan,
            None => {
                error!(self.log,
                    "object {} is not on loan here, ignoring invalidate", id);
                return false;
            }
        };
        // Someone else may hold the object by now.
        if !self.loan_is_live(&loan) {
            warn!(self.log,
                "object {} was borrowed by an ended session, not destroying it",
                id);
            return false;
        }
        let destroyed = self.destroy_object(&id, object);
        if destroyed {
            let result = self
                .zk
                .transaction()
                .in_session(loan.session)
                .delete(&self.paths.master_node(&id))
                .delete(&self.paths.used_node(&id))
                .commit();
            match result {
                Ok(_) => MetricsTracker::incr(&self.metrics.invalidated),
                Err(e) => {
                    error!(self.log, "failed to remove object {}: {}", id, e)
                }
            }
        }
        destroyed
    }

    fn destroy_object(&self, id: &ObjectId, object: F::Object) -> bool {
        match self.factory().destroy(object) {
            Ok(()) => {
                MetricsTracker::incr(&self.metrics.destroyed);
                true
            }
            Err(FactoryError::Zombie(msg)) => {
                if !self.shutdown.load(Ordering::SeqCst) {
                    warn!(self.log, "object {} is a zombie: {}", id, msg);
                    if let Err(e) = self.handle_zombie(id) {
                        error!(self.log, "failed to mark zombie {}: {}", id, e);
                    }
                }
                false
            }
            Err(e) => {
                error!(self.log, "error destroying object {}: {}", id, e);
                false
            }
        }
    }

    pub fn borrow_specific(
        &self,
        id: &ObjectId,
    ) -> Option<PooledObject<F::Object>> {
        match self.claim(id) {
            Claim::Borrowed(obj) => Some(obj),
            Claim::Removed | Claim::Unavailable => None,
        }
    }

    /// Borrow the object with the given id, reporting whether it turned out
    /// to be unusable and was taken out of the pool along the way.
    pub(crate) fn claim(&self, id: &ObjectId) -> Claim<F::Object> {
        if !self.is_running() {
            return Claim::Unavailable;
        }
        let session = match self.zk.ensure_session() {
            Ok(session) => session,
            Err(e) => {
                error!(self.log, "unable to borrow object {}: {}", id, e);
                return Claim::Unavailable;
            }
        };
        match self.mark_used(id, session) {
            Ok(true) => (),
            Ok(false) => return Claim::Unavailable,
            Err(e) => {
                error!(self.log, "failed to mark object {} used: {}", id, e);
                return Claim::Unavailable;
            }
        }
        let obj = match self.mark_borrowed(id, session) {
            Ok(obj) => obj,
            Err(Error::Factory(e)) => {
                warn!(self.log, "discarding unreadable object {}: {}", id, e);
                self.purge(id, session);
                return Claim::Removed;
            }
            Err(e) => {
                error!(self.log, "failed to load object {}: {}", id, e);
                if let Err(e) = self.mark_unused(id, session) {
                    error!(self.log, "failed to release object {}: {}", id, e);
                }
                return Claim::Unavailable;
            }
        };
        match self.factory().validate(&obj) {
            Ok(true) => Claim::Borrowed(PooledObject::new(id.clone(), obj)),
            Err(FactoryError::Zombie(msg)) => {
                warn!(self.log, "object {} is a zombie: {}", id, msg);
                self.unborrow(id);
                if let Err(e) = self.handle_zombie(id) {
                    error!(self.log, "failed to mark zombie {}: {}", id, e);
                }
                Claim::Unavailable
            }
            _ => {
                if self.invalidate(PooledObject::new(id.clone(), obj)) {
                    Claim::Removed
                } else {
                    Claim::Unavailable
                }
            }
        }
    }

    /// zombie -> unused. Returns false if `id` is not a zombie.
    pub(crate) fn unzombie(&self, id: &ObjectId) -> Result<bool> {
        let zombie = self.paths.zombie_node(id);
        if !self.zk.exists(&zombie)? {
            return Ok(false);
        }
        // The used marker is gone if the owner crashed.
        let used = self.paths.used_node(id);
        let mut txn = self.zk.transaction();
        if self.zk.exists(&used)? {
            txn = txn.delete(&used);
        }
        match txn.delete(&zombie).create(&self.paths.unused_node(id)).commit() {
            Ok(_) => Ok(true),
            Err(ref e) if e.is_no_node() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// zombie -> destroyed. Returns false if `id` is not a zombie.
    pub(crate) fn drop_zombie(&self, id: &ObjectId) -> Result<bool> {
        let zombie = self.paths.zombie_node(id);
        if !self.zk.exists(&zombie)? {
            return Ok(false);
        }
        let mut txn = self.zk.transaction().delete(&zombie);
        for node in &[self.paths.master_node(id), self.paths.used_node(id)] {
            if self.zk.exists(node)? {
                txn = txn.delete(node);
            }
        }
        match txn.commit() {
            Ok(_) => Ok(true),
            Err(ref e) if e.is_no_node() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn zombie_ids(&self) -> Result<Vec<ObjectId>> {
        let mut ids: Vec<ObjectId> = self
            .zk
            .children(self.paths.zombies())?
            .into_iter()
            .map(ObjectId::from)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // Dispose of this participant's objects on the way out. The last
    // participant destroys everything and removes the pool.
    fn release_all(&self, participants_left: usize) -> Result<()> {
        let borrowed: Vec<(ObjectId, Loan)> =
            locked(&self.borrowed).drain().collect();
        if !borrowed.is_empty() {
            warn!(self.log,
                "there are {} objects still in use, proceeding with shutdown",
                borrowed.len());
        }

        if participants_left > 0 {
            for (id, loan) in borrowed {
                match self.mark_unused(&id, loan.session) {
                    Ok(()) => (),
                    Err(Error::SessionReplaced(_)) => {
                        debug!(self.log, "object {} went with an ended session",
                            id)
                    }
                    Err(e) => {
                        warn!(self.log, "failed to release object {}: {}", id, e)
                    }
                }
            }
            info!(self.log,
                "there are still {} participants in the pool, leaving pool intact",
                participants_left);
            return Ok(());
        }

        info!(self.log, "no participants left in the pool, cleaning up");
        for child in self.zk.children(self.paths.master())? {
            let id = ObjectId::from(child);
            match self.load(&id) {
                Ok(obj) => {
                    self.destroy_object(&id, obj);
                }
                Err(e) => warn!(self.log, "unable to load object {}: {}", id, e),
            }
        }
        self.zk
            .transaction()
            .delete_recursive(self.paths.base())?
            .commit()
            .map(|_| ())
    }
}

/// Pick which of `unused` sorted candidates to try. The window is the lowest
/// 40% of `used`, or every candidate when that is empty or larger than the
/// candidate list.
pub fn select_index<R: Rng>(used: usize, unused: usize, rng: &mut R) -> usize {
    let mut limit = (used as f64 * SELECTION_WINDOW) as usize;
    if limit == 0 || limit >= unused {
        limit = unused;
    }
    if limit == 0 {
        return 0;
    }
    rng.gen_range(0, limit)
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::quickcheck;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    quickcheck! {
        fn prop_select_index_in_window(used: usize, unused: usize, seed: u64)
            -> bool
        {
            let used = used % 10_000;
            let unused = unused % 10_000 + 1;
            let mut rng = StdRng::seed_from_u64(seed);
            let idx = select_index(used, unused, &mut rng);
            let window = (used as f64 * 0.4) as usize;
            if window == 0 || window >= unused {
                idx < unused
            } else {
                idx < window
            }
        }
    }

    #[test]
    fn select_index_small_pools() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(select_index(0, 1, &mut rng), 0);
        assert_eq!(select_index(2, 1, &mut rng), 0);
        for _ in 0..100 {
            assert!(select_index(10, 3, &mut rng) < 3);
            assert!(select_index(10, 8, &mut rng) < 4);
        }
    }

    #[test]
    fn pool_state_display() {
        assert_eq!(PoolState::Running.to_string(), "running");
        assert_eq!(PoolState::Stopped.to_string(), "stopped");
    }
}
