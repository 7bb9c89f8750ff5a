//! Redis-backed store implementation.
//!
//! Commands go through a shared `ConnectionManager`, which reconnects on
//! its own. Pub/sub requires a dedicated connection per subscription, so
//! `subscribe` takes a fresh one and hands it to a forwarding task.

use crate::store::{Store, StoreError, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A [`Store`] backed by a shared Redis deployment.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the initial connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        debug!("Connected to Redis");
        Ok(Self { client, manager })
    }

    fn commands(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.commands();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.commands();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.commands();
        Ok(conn.incr::<_, _, i64>(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.commands();
        conn.expire::<_, ()>(key, ttl_secs(ttl) as i64).await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.commands();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.commands();
        Ok(conn.rpop::<_, Option<String>>(key, None).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut conn = self.commands();
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(receivers.max(0) as usize)
    }

    #[allow(deprecated)] // PubSub needs a dedicated connection, not the manager.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;

        let name = channel.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %name, error = %e, "Undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
            debug!(channel = %name, "Pub/sub stream ended");
        });

        Ok(Subscription::new(rx, forwarder))
    }
}
