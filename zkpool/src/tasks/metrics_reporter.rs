// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use itertools::Itertools;
use slog::{info, o, warn, Logger};
use timer::Guard;

use crate::error::Result;
use crate::factory::ObjectFactory;
use crate::object_pool::PoolInner;
use crate::tasks::PoolTask;

/// Logs a metrics snapshot every metric interval.
pub struct MetricsReporter<F>
where
    F: ObjectFactory,
{
    pool: Arc<PoolInner<F>>,
    interval: chrono::Duration,
    timer: Option<timer::Timer>,
    _guard: Option<Guard>,
    log: Logger,
}

impl<F> MetricsReporter<F>
where
    F: ObjectFactory,
{
    /// The reporter, if the pool has a metric interval.
    pub fn new(pool: Arc<PoolInner<F>>) -> Option<Self> {
        let period = pool.config.metric_period()?;
        let interval = chrono::Duration::milliseconds(period.as_millis() as i64);
        let log = pool.log.new(o!("component" => "MetricsReporter"));
        Some(MetricsReporter {
            pool,
            interval,
            timer: None,
            _guard: None,
            log,
        })
    }
}

impl<F> PoolTask for MetricsReporter<F>
where
    F: ObjectFactory,
{
    fn name(&self) -> &str {
        "metrics reporter"
    }

    fn start(&mut self) -> Result<()> {
        let timer = timer::Timer::new();
        let pool = Arc::clone(&self.pool);
        let log = self.log.clone();
        let guard = timer.schedule_repeating(self.interval, move || {
            if !pool.is_running() {
                return;
            }
            match pool.metrics_snapshot() {
                Ok(metrics) => {
                    let line = metrics
                        .export()
                        .into_iter()
                        .sorted()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .join(" ");
                    info!(log, "pool metrics: {}", line);
                }
                Err(e) => warn!(log, "unable to collect pool metrics: {}", e),
            }
        });
        self.timer = Some(timer);
        self._guard = Some(guard);
        Ok(())
    }

    fn shutdown(&mut self) {
        // Dropping the guard cancels the schedule.
        let _guard = self._guard.take();
        let _timer = self.timer.take();
    }
}
