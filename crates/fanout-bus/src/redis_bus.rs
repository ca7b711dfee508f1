use crate::{Bus, BusError, BusSubscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Production `Bus` backend over Redis: a multiplexed `ConnectionManager` for
/// publish / lease operations, and a dedicated `PubSub` connection per
/// subscription (Redis requires subscribers to own their connection).
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::Publish(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload.to_vec())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(Box::pin(stream))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        let mut conn = self.manager.clone();
        let won: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Lease(e.to_string()))?;
        Ok(won.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| BusError::Lease(e.to_string()))
    }
}
