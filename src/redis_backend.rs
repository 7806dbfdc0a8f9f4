//! Redis backend for the L2 tier and cross-instance invalidation
//!
//! Values are stored with `SET EX` so Redis expires them natively; the envelope
//! carries its own expiry as well (see [`crate::remote_tier`]).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;
use crate::orchestrator::{InvalidationPublisher, WeakAuthCache};
use crate::pool::ConnectionManager;
use crate::remote_tier::{KeyFormatter, RecordBackend};

pub const DEFAULT_KEY_PREFIX: &str = "authcache:user:";
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "authcache:invalidate:user";

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct RedisBackend {
    client: redis::Client,
    name: String,
}

impl RedisBackend {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            name: "redis".to_owned(),
        }
    }

    pub fn open(url: &str) -> Result<Self, CacheError> {
        Ok(Self::new(redis::Client::open(url)?))
    }
}

#[async_trait]
impl ConnectionManager for RedisBackend {
    type Connection = MultiplexedConnection;

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<MultiplexedConnection, CacheError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn ping(&self, conn: &mut MultiplexedConnection) -> Result<(), CacheError> {
        redis::cmd("PING").query_async::<String>(conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordBackend for RedisBackend {
    async fn fetch(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("L2 (Redis) GET error for key {}: {}", key, e);
                Err(e.into())
            }
        }
    }

    async fn store(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!("L2 (Redis) SETEX error for key {}: {}", key, e);
            return Err(e.into());
        }
        debug!("L2 (Redis) stored key {} (TTL {}s)", key, ttl_secs);
        Ok(())
    }

    async fn delete(&self, conn: &mut MultiplexedConnection, key: &str) -> Result<(), CacheError> {
        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!("L2 (Redis) DEL error for key {}: {}", key, e);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Redis keys of the form `authcache:user:<username>`
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisKeyFormatter;

impl KeyFormatter for RedisKeyFormatter {
    fn format_key(&self, username: &str) -> String {
        format!("{DEFAULT_KEY_PREFIX}{username}")
    }
}

/// Payload published on the invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InvalidationMessage {
    /// Instance that ran the invalidation
    origin: String,
    username: String,
}

/// Redis pub/sub channel announcing invalidated users to every instance
pub struct RedisInvalidationBus {
    client: redis::Client,
    channel: String,
    instance_id: String,
    publisher: OnceCell<redis::aio::ConnectionManager>,
}

impl RedisInvalidationBus {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            instance_id: format!("{:016x}", rand::random::<u64>()),
            publisher: OnceCell::new(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe and apply announced invalidations to `cache`
    ///
    /// Each announcement fences the user locally and drops the L1 copy; this
    /// instance's own announcements are skipped. Reconnects with exponential
    /// backoff whenever the subscription drops. The task exits once the cache
    /// has been dropped.
    pub fn spawn_listener(&self, cache: WeakAuthCache) -> JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(100);
            while !cache.is_dropped() {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!(
                            "Invalidation listener: failed to create Redis pubsub connection: {}. Retrying in {:?}",
                            e, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_BACKOFF);
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!(
                        "Invalidation listener: subscribe to {} failed: {}. Retrying in {:?}",
                        channel, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    continue;
                }
                info!("Invalidation listener: subscribed to channel {}", channel);
                delay = Duration::from_millis(100);

                let mut messages = pubsub.on_message();
                while let Some(msg) = messages.next().await {
                    let Some(cache) = cache.upgrade() else {
                        debug!("Invalidation listener: cache dropped, stopping");
                        return;
                    };
                    let payload = match msg.get_payload::<String>() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Invalidation listener: failed to read payload: {}", e);
                            continue;
                        }
                    };
                    match decode_message(&payload, &instance_id) {
                        Ok(Some(username)) => {
                            cache.revoke_local(&username);
                            debug!("Invalidation received for user: {}", username);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Invalidation listener: failed to decode payload: {}", e);
                        }
                    }
                }
                error!(
                    "Invalidation listener: subscription to {} ended, reconnecting",
                    channel
                );
            }
        })
    }
}

/// Username to revoke, or `None` for an empty or self-originated announcement
fn decode_message(payload: &str, instance_id: &str) -> Result<Option<String>, CacheError> {
    let message: InvalidationMessage = serde_json::from_str(payload)?;
    if message.origin == instance_id || message.username.is_empty() {
        return Ok(None);
    }
    Ok(Some(message.username))
}

#[async_trait]
impl InvalidationPublisher for RedisInvalidationBus {
    async fn publish(&self, username: &str) -> Result<(), CacheError> {
        let payload = serde_json::to_string(&InvalidationMessage {
            origin: self.instance_id.clone(),
            username: username.to_owned(),
        })?;
        let conn = self
            .publisher
            .get_or_try_init(|| redis::aio::ConnectionManager::new(self.client.clone()))
            .await?;
        let mut conn = conn.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        debug!(
            "Cache invalidation published on channel '{}': {}",
            self.channel, username
        );
        Ok(())
    }
}
