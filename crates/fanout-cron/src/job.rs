use crate::error::CronError;
use cron::Schedule;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A job's executable body: takes nothing, returns nothing, boxed so
/// `Scheduler` can hold a heterogeneous set of jobs behind one type.
pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Default `execution_timeout` (and therefore lease TTL) a job gets when
/// neither it nor the scheduler registering it specifies one. Matches
/// spec.md §3's "`execution_timeout` (default 5 minutes)".
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// A named periodic unit of work, gated cluster-wide by a bus lease keyed on
/// its name before every firing.
#[derive(Clone)]
pub struct Job {
    pub(crate) name: String,
    pub(crate) schedule: Schedule,
    pub(crate) execution_timeout: Duration,
    pub(crate) run: JobFn,
}

impl Job {
    /// `expression` is a six-field (seconds-precision) cron expression.
    /// `execution_timeout` doubles as the TTL of the cluster lease acquired
    /// before each firing — a run that overruns it loses mutual exclusion to
    /// another node, so job bodies must be idempotent or self-fencing.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        expression: &str,
        execution_timeout: Duration,
        run: F,
    ) -> Result<Self, CronError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let schedule = Schedule::from_str(expression).map_err(|source| CronError::InvalidSchedule {
            expression: expression.to_owned(),
            source,
        })?;
        Ok(Self {
            name: name.into(),
            schedule,
            execution_timeout,
            run: Arc::new(move || Box::pin(run())),
        })
    }

    /// Like `new`, but `execution_timeout: None` falls back to `default`
    /// (spec.md §6's `cron.default_execution_timeout`, e.g. the scheduler's
    /// configured default) instead of requiring every caller to name one.
    pub fn with_timeout_or_default<F, Fut>(
        name: impl Into<String>,
        expression: &str,
        execution_timeout: Option<Duration>,
        default: Duration,
        run: F,
    ) -> Result<Self, CronError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(name, expression, execution_timeout.unwrap_or(default), run)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }
}
