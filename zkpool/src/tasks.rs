// Copyright 2020 Joyent, Inc.

//
// Background supervisors that keep the shared pool healthy: the crash
// detector restores objects orphaned by departed participants, eviction
// destroys idle objects, the zombie reconciler settles objects of unknown
// state and the metrics reporter logs pool activity.
//

pub mod crash_detector;
pub mod eviction;
pub mod metrics_reporter;
pub mod zombie;

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::{debug, info, o, warn, Logger};

use crate::error::Result;

// How long shutdown waits for a running tick to finish before detaching
// the task thread.
pub const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A supervisor that runs for the life of the pool.
pub trait PoolTask: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    fn shutdown(&mut self);
}

/// Starts supervisors in the order they were added and stops them in
/// reverse.
pub struct TaskManager {
    tasks: Vec<Box<dyn PoolTask>>,
    started: usize,
    log: Logger,
}

impl TaskManager {
    pub fn new(log: &Logger) -> Self {
        TaskManager {
            tasks: Vec::new(),
            started: 0,
            log: log.new(o!("component" => "TaskManager")),
        }
    }

    pub fn add(&mut self, task: Box<dyn PoolTask>) {
        self.tasks.push(task);
    }

    pub fn start(&mut self) -> Result<()> {
        for task in self.tasks.iter_mut().skip(self.started) {
            info!(self.log, "starting {}", task.name());
            task.start()?;
            self.started += 1;
        }
        Ok(())
    }

    pub fn shutdown(mut self) {
        let started = self.started;
        for task in self.tasks.iter_mut().take(started).rev() {
            info!(self.log, "stopping {}", task.name());
            task.shutdown();
        }
        self.started = 0;
    }
}

struct Running {
    stop: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Runs a tick on its own thread at a fixed rate. A tick that overruns the
/// period delays the next one rather than queueing it.
pub struct PeriodicTask {
    name: String,
    period: Duration,
    tick: Option<Box<dyn FnMut() + Send>>,
    running: Option<Running>,
    log: Logger,
}

impl PeriodicTask {
    pub fn new<T>(name: &str, period: Duration, log: &Logger, tick: T) -> Self
    where
        T: FnMut() + Send + 'static,
    {
        PeriodicTask {
            name: String::from(name),
            period,
            tick: Some(Box::new(tick)),
            running: None,
            log: log.new(o!("component" => String::from(name))),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl PoolTask for PeriodicTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        let mut tick = match self.tick.take() {
            Some(tick) => tick,
            None => return Ok(()),
        };
        let (stop_tx, stop_rx) = channel();
        let (done_tx, done_rx) = channel();
        let period = self.period;
        let log = self.log.clone();

        let handle = thread::Builder::new()
            .name(format!("zkpool-{}", self.name))
            .spawn(move || {
                let mut next = Instant::now() + period;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            debug!(log, "tick");
                            tick();
                            next += period;
                            let now = Instant::now();
                            if next < now {
                                next = now;
                            }
                        }
                        _ => break,
                    }
                }
                let _ = done_tx.send(());
            })?;

        self.running = Some(Running {
            stop: stop_tx,
            done: done_rx,
            handle,
        });
        Ok(())
    }

    fn shutdown(&mut self) {
        let running = match self.running.take() {
            Some(running) => running,
            None => return,
        };
        let _ = running.stop.send(());
        match running.done.recv_timeout(TASK_SHUTDOWN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = running.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(self.log,
                    "task did not stop within {:?}, detaching",
                    TASK_SHUTDOWN_TIMEOUT);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use slog::Discard;

    #[test]
    fn periodic_task_ticks_until_shutdown() {
        let log = Logger::root(Discard, o!());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut task =
            PeriodicTask::new("ticker", Duration::from_millis(20), &log, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        task.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        task.shutdown();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {} ticks", seen);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    struct Recorder {
        name: String,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl PoolTask for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self) -> Result<()> {
            self.events.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        fn shutdown(&mut self) {
            self.events.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    #[test]
    fn task_manager_stops_in_reverse_order() {
        let log = Logger::root(Discard, o!());
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut manager = TaskManager::new(&log);
        for name in &["a", "b", "c"] {
            manager.add(Box::new(Recorder {
                name: String::from(*name),
                events: Arc::clone(&events),
            }));
        }
        manager.start().unwrap();
        manager.shutdown();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }
}
