use crate::error::CronError;
use crate::job::{Job, DEFAULT_EXECUTION_TIMEOUT};
use chrono::Utc;
use fanout_bus::{Bus, BusError};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Entry {
    job: Job,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Runs named periodic jobs such that at most one node in the fleet executes
/// a given firing, by gating each one on a `bus`-backed lease keyed by job
/// name. See `Job::new` for the per-job TTL/self-fencing contract.
pub struct Scheduler {
    bus: Arc<dyn Bus>,
    jobs: RwLock<HashMap<String, Entry>>,
    running: RwLock<bool>,
    /// Lease TTL (and `Job::execution_timeout`) jobs registered through
    /// `register_with_timeout` get when they don't name their own — spec.md
    /// §6's `cron.default_execution_timeout`.
    default_execution_timeout: Duration,
}

impl Scheduler {
    /// Equivalent to `with_default_timeout(bus, Job::DEFAULT_EXECUTION_TIMEOUT)`.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self::with_default_timeout(bus, DEFAULT_EXECUTION_TIMEOUT)
    }

    /// `default_execution_timeout` is the lease TTL jobs registered via
    /// `register_with_timeout` fall back to when they don't specify their
    /// own — typically wired from a deployment's
    /// `cron.default_execution_timeout` configuration option.
    #[must_use]
    pub fn with_default_timeout(bus: Arc<dyn Bus>, default_execution_timeout: Duration) -> Self {
        Self {
            bus,
            jobs: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
            default_execution_timeout,
        }
    }

    /// Register `job`. If a job with the same name is already registered, it
    /// is replaced: its scheduling loop is cancelled (any firing currently
    /// in flight for it completes undisturbed) and the new job takes over
    /// the name. If the scheduler is already started, the new job's loop
    /// starts immediately; otherwise it starts with the next `start()` call.
    pub async fn register(&self, job: Job) {
        let name = job.name().to_owned();
        let mut jobs = self.jobs.write().await;
        if let Some(old) = jobs.remove(&name) {
            old.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        let running = *self.running.read().await;
        let handle = running.then(|| self.spawn(job.clone(), cancel.clone()));
        jobs.insert(name, Entry { job, cancel, handle });
    }

    /// Build a `Job` from `expression`/`run`, falling back to this
    /// scheduler's configured `default_execution_timeout` when
    /// `execution_timeout` is `None`, and register it.
    pub async fn register_with_timeout<F, Fut>(
        &self,
        name: impl Into<String>,
        expression: &str,
        execution_timeout: Option<Duration>,
        run: F,
    ) -> Result<(), CronError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Job::with_timeout_or_default(
            name,
            expression,
            execution_timeout,
            self.default_execution_timeout,
            run,
        )?;
        self.register(job).await;
        Ok(())
    }

    /// Detach the named job. Any firing already in flight completes
    /// normally; no new firing is scheduled after this call returns.
    pub async fn remove(&self, name: &str) {
        if let Some(entry) = self.jobs.write().await.remove(name) {
            entry.cancel.cancel();
        }
    }

    /// Start the scheduling loop for every currently registered job. Jobs
    /// registered after `start()` begin running immediately (see
    /// `register`).
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let mut jobs = self.jobs.write().await;
        for entry in jobs.values_mut() {
            if entry.handle.is_none() {
                entry.handle = Some(self.spawn(entry.job.clone(), entry.cancel.clone()));
            }
        }
    }

    /// Cancel every job's scheduling loop and block until all in-flight runs
    /// have returned.
    pub async fn stop(&self) {
        *self.running.write().await = false;

        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.jobs.write().await;
            jobs.values_mut()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.handle.take()
                })
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn(&self, job: Job, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_schedule(job, self.bus.clone(), cancel))
    }
}

async fn run_schedule(job: Job, bus: Arc<dyn Bus>, cancel: CancellationToken) {
    loop {
        let Some(next_fire) = job.schedule.upcoming(Utc).next() else {
            warn!(job = job.name(), "cron schedule has no upcoming firings, stopping");
            return;
        };
        let delay = (next_fire - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        fire(&job, &bus).await;
    }
}

async fn fire(job: &Job, bus: &Arc<dyn Bus>) {
    let lease_key = format!("cron:lock:{}", job.name());
    match bus.set_if_absent(&lease_key, "1", job.execution_timeout()).await {
        Ok(true) => run_under_recovery(job, bus, &lease_key).await,
        Ok(false) => debug!(job = job.name(), "skipped — another instance holds the lease"),
        Err(err) => warn!(job = job.name(), error = %err, "lease acquisition failed, skipping firing"),
    }
}

async fn run_under_recovery(job: &Job, bus: &Arc<dyn Bus>, lease_key: &str) {
    info!(job = job.name(), "firing");
    let started = Instant::now();
    let result = futures::FutureExt::catch_unwind(AssertUnwindSafe((job.run)())).await;
    let elapsed = started.elapsed();
    match result {
        Ok(()) => info!(job = job.name(), elapsed_ms = elapsed.as_millis() as u64, "completed"),
        Err(_) => {
            let panic = CronError::JobPanic { job: job.name().to_owned() };
            error!(error = %panic, "recovered");
        }
    }
    if let Err(err) = release(bus, lease_key).await {
        warn!(job = job.name(), error = %err, "failed to release lease early; it will expire at TTL");
    }
}

async fn release(bus: &Arc<dyn Bus>, lease_key: &str) -> Result<(), BusError> {
    bus.delete(lease_key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_bus::InMemoryBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn registered_job_fires_at_least_once_after_start() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Scheduler::new(bus);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job = Job::new("tick", "* * * * * *", StdDuration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        scheduler.register(job).await;
        scheduler.start().await;
        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        scheduler.stop().await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn two_schedulers_sharing_a_bus_fire_the_same_job_at_most_once_per_tick() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler_a = Scheduler::new(bus.clone());
        let scheduler_b = Scheduler::new(bus);
        let calls = Arc::new(AtomicUsize::new(0));

        let make_job = |calls: Arc<AtomicUsize>| {
            Job::new("shared", "* * * * * *", StdDuration::from_secs(5), move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
        };

        scheduler_a.register(make_job(calls.clone())).await;
        scheduler_b.register(make_job(calls.clone())).await;
        scheduler_a.start().await;
        scheduler_b.start().await;

        tokio::time::sleep(StdDuration::from_millis(1200)).await;
        scheduler_a.stop().await;
        scheduler_b.stop().await;

        // One tick elapsed (roughly): both schedulers raced for the lease,
        // exactly one should have won it, so calls should be far below 2x
        // what an unguarded double-fire would produce.
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_schedule() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Scheduler::new(bus);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job = Job::new("flaky", "* * * * * *", StdDuration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("boom");
                }
            }
        })
        .unwrap();

        scheduler.register(job).await;
        scheduler.start().await;
        tokio::time::sleep(StdDuration::from_millis(2500)).await;
        scheduler.stop().await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn remove_stops_future_firings() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Scheduler::new(bus);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job = Job::new("removable", "* * * * * *", StdDuration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        scheduler.register(job).await;
        scheduler.start().await;
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        scheduler.remove("removable").await;
        let after_remove = calls.load(Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_remove);
    }

    #[tokio::test]
    async fn register_with_timeout_falls_back_to_the_scheduler_default() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Scheduler::with_default_timeout(bus, StdDuration::from_secs(42));

        scheduler
            .register_with_timeout("defaulted", "* * * * * *", None, || async {})
            .await
            .unwrap();

        let jobs = scheduler.jobs.read().await;
        assert_eq!(
            jobs.get("defaulted").unwrap().job.execution_timeout(),
            StdDuration::from_secs(42)
        );
    }
}
