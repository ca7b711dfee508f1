#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron schedule {expression:?}: {source}")]
    InvalidSchedule {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
    /// Raised only for logging: a job's body panicked. The scheduler itself
    /// never propagates this — the schedule keeps running after the panic is
    /// caught, per the at-most-once-per-firing contract.
    #[error("job {job:?} panicked")]
    JobPanic { job: String },
}
