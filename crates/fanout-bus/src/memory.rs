use crate::{Bus, BusError, BusSubscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process `Bus` implementation backed by `tokio::sync::broadcast`
/// channels and a lease table with wall-clock expiry. Used by this crate's
/// own tests, and suitable for single-process deployments that don't need a
/// real cluster.
#[derive(Default)]
pub struct InMemoryBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    leases: Mutex<HashMap<String, Instant>>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel(&self, name: &str) -> broadcast::Sender<Bytes> {
        if let Some(tx) = self.channels.read().await.get(name) {
            return tx.clone();
        }
        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.get(name) {
            return tx.clone();
        }
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        channels.insert(name.to_owned(), tx.clone());
        tx
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        // No subscribers is not an error: the bus has no persistence, so a
        // publish with nobody listening is simply dropped, same as on a real
        // pub/sub transport.
        let _ = self.channel(channel).await.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let rx = self.channel(channel).await.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        _value: &str,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        let mut leases = self.leases.lock().expect("lease table mutex poisoned");
        let now = Instant::now();
        if let Some(expiry) = leases.get(key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        leases.insert(key.to_owned(), now + ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.leases
            .lock()
            .expect("lease table mutex poisoned")
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscriber_is_a_no_op() {
        let bus = InMemoryBus::new();
        bus.publish("ch", Bytes::from_static(b"hi")).await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("ch").await.unwrap();
        bus.publish("ch", Bytes::from_static(b"hello")).await.unwrap();
        let got = sub.next().await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("ch").await.unwrap();
        let mut b = bus.subscribe("ch").await.unwrap();
        bus.publish("ch", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn set_if_absent_grants_exactly_one_winner() {
        let bus = InMemoryBus::new();
        let ttl = Duration::from_secs(10);
        assert!(bus.set_if_absent("lock:a", "1", ttl).await.unwrap());
        assert!(!bus.set_if_absent("lock:a", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn delete_releases_the_lease_early() {
        let bus = InMemoryBus::new();
        let ttl = Duration::from_secs(10);
        assert!(bus.set_if_absent("lock:a", "1", ttl).await.unwrap());
        bus.delete("lock:a").await.unwrap();
        assert!(bus.set_if_absent("lock:a", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn lease_is_reacquirable_after_ttl_expires() {
        let bus = InMemoryBus::new();
        let ttl = Duration::from_millis(20);
        assert!(bus.set_if_absent("lock:a", "1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bus.set_if_absent("lock:a", "1", ttl).await.unwrap());
    }
}
