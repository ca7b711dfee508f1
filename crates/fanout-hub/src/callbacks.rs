use async_trait::async_trait;
use fanout_protocol::Envelope;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Lifecycle hooks a Hub invokes for application code. All methods default to
/// a no-op so callers only override what they need.
///
/// Each hook is awaited inline, on the calling session's own read/write task
/// (see `run_guarded`'s call sites in `session.rs`), wrapped in
/// `catch_unwind` so a panicking handler only takes down that one session's
/// task instead of the process. A slow handler backs up that same session's
/// loop; it does not block delivery to any other session.
#[async_trait]
pub trait HubCallbacks: Send + Sync + 'static {
    async fn on_connect(&self, _recipient_id: u64) {}
    async fn on_disconnect(&self, _recipient_id: u64) {}
    async fn on_message(&self, _recipient_id: u64, _envelope: &Envelope) {}
}

/// Default callback set: does nothing.
#[derive(Debug, Default)]
pub struct NoopCallbacks;

#[async_trait]
impl HubCallbacks for NoopCallbacks {}

/// Runs `fut` and logs (rather than propagates) a panic, so one bad callback
/// can't crash the task that drives it.
pub(crate) async fn run_guarded<F>(label: &'static str, fut: F)
where
    F: std::future::Future<Output = ()>,
{
    let result = futures::FutureExt::catch_unwind(AssertUnwindSafe(fut)).await;
    if result.is_err() {
        error!(callback = label, "callback panicked; recovered");
    }
}
