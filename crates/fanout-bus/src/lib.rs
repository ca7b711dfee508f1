// fanout-bus: the abstract publish/subscribe + set-if-absent-with-TTL
// capability the Cluster Bridge and the distributed cron scheduler depend on.
//
// Kept deliberately narrow — two concerns only: fan-out messaging (publish /
// subscribe) and exclusivity leasing (set_if_absent / delete). Neither the
// bridge nor the scheduler care about anything else a real message bus offers
// (consumer groups, streams, acking, ...).

mod error;
mod memory;
mod redis_bus;

pub use error::BusError;
pub use memory::InMemoryBus;
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// A subscription to a bus channel: an unbounded stream of raw message
/// payloads. Dropping it unsubscribes.
pub type BusSubscription = BoxStream<'static, Bytes>;

/// An abstract publish/subscribe transport with set-if-absent-with-TTL
/// primitives, treated as a black box by both the Cluster Bridge and the
/// distributed cron scheduler.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish `payload` on `channel`. Every current subscriber on every node
    /// receives a copy; there is no persistence and no ordering guarantee
    /// across channels or publishers.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to `channel`, returning a stream of payloads published after
    /// the subscription is established. Messages published before
    /// subscribing are not delivered.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;

    /// Atomically set `key` to `value` with the given TTL, but only if `key`
    /// is currently absent (or has already expired). Returns `true` iff this
    /// call won the lease.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, BusError>;

    /// Best-effort delete of `key`. Used to release a lease early; if this
    /// fails the lease still expires naturally at its TTL.
    async fn delete(&self, key: &str) -> Result<(), BusError>;
}
