//! Redis-backed implementation of the `Bus` port.
//!
//! Failures never propagate to callers: reads degrade to cache misses,
//! writes and publishes are dropped with a warning. Job state lives in the
//! relational store, so losing broker traffic loses progress display at
//! worst.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use uwb_core::ports::Bus;

/// Redis-backed bus: JSON strings in keys/hashes/lists, pub/sub for deltas.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis; fails fast so a misconfigured URL is caught at
    /// startup rather than silently degrading forever.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn decode(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}

#[async_trait]
impl Bus for RedisBus {
    async fn ping(&self) -> bool {
        let mut conn = self.conn();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => true,
            Err(error) => {
                warn!(%error, "redis ping failed");
                false
            }
        }
    }

    async fn get_json(&self, key: &str) -> Option<Value> {
        let mut conn = self.conn();
        match conn.get::<_, Option<String>>(key).await {
            Ok(raw) => raw.as_deref().and_then(decode),
            Err(error) => {
                warn!(key, %error, "redis GET failed");
                None
            }
        }
    }

    async fn set_json(&self, key: &str, value: &Value) {
        let mut conn = self.conn();
        if let Err(error) = conn.set::<_, _, ()>(key, value.to_string()).await {
            warn!(key, %error, "redis SET failed");
        }
    }

    async fn set_json_ex(&self, key: &str, value: &Value, ttl_secs: u64) {
        let mut conn = self.conn();
        if let Err(error) = conn.set_ex::<_, _, ()>(key, value.to_string(), ttl_secs).await {
            warn!(key, %error, "redis SETEX failed");
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn();
        if let Err(error) = conn.del::<_, ()>(key).await {
            warn!(key, %error, "redis DEL failed");
        }
    }

    async fn hash_get_all(&self, key: &str) -> HashMap<String, Value> {
        let mut conn = self.conn();
        match conn.hgetall::<_, HashMap<String, String>>(key).await {
            Ok(raw) => raw
                .into_iter()
                .filter_map(|(field, value)| decode(&value).map(|v| (field, v)))
                .collect(),
            Err(error) => {
                warn!(key, %error, "redis HGETALL failed");
                HashMap::new()
            }
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &Value) {
        let mut conn = self.conn();
        if let Err(error) = conn.hset::<_, _, _, ()>(key, field, value.to_string()).await {
            warn!(key, field, %error, "redis HSET failed");
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) {
        let mut conn = self.conn();
        if let Err(error) = conn.hdel::<_, _, ()>(key, field).await {
            warn!(key, field, %error, "redis HDEL failed");
        }
    }

    async fn hash_increment_by(&self, key: &str, field: &str, delta: i64) {
        let mut conn = self.conn();
        if let Err(error) = conn.hincr::<_, _, _, ()>(key, field, delta).await {
            warn!(key, field, %error, "redis HINCRBY failed");
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) {
        let mut conn = self.conn();
        if let Err(error) = conn.expire::<_, ()>(key, ttl_secs as i64).await {
            warn!(key, %error, "redis EXPIRE failed");
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        match conn.scan_match::<_, String>(&pattern).await {
            Ok(mut iter) => {
                let mut keys = Vec::new();
                while let Some(Ok(key)) = iter.next_item().await {
                    keys.push(key);
                }
                keys
            }
            Err(error) => {
                warn!(prefix, %error, "redis SCAN failed");
                Vec::new()
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &Value) {
        let mut conn = self.conn();
        if let Err(error) = conn.publish::<_, _, ()>(channel, payload.to_string()).await {
            warn!(channel, %error, "redis PUBLISH failed");
        }
    }

    async fn subscribe(&self, channel: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(error) => {
                    warn!(channel, %error, "redis pubsub connect failed");
                    return;
                }
            };
            if let Err(error) = pubsub.subscribe(&channel).await {
                warn!(channel, %error, "redis SUBSCRIBE failed");
                return;
            }

            let mut stream = pubsub.into_on_message();
            while let Some(message) = stream.next().await {
                let Ok(raw) = message.get_payload::<String>() else {
                    continue;
                };
                let Some(value) = decode(&raw) else { continue };
                if tx.send(value).await.is_err() {
                    // Receiver dropped: the WebSocket went away.
                    break;
                }
            }
            debug!(channel, "pubsub forwarder exiting");
        });

        rx
    }

    async fn queue_push(&self, queue: &str, payload: &Value) -> bool {
        let mut conn = self.conn();
        match conn.lpush::<_, _, ()>(queue, payload.to_string()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(queue, %error, "redis LPUSH failed");
                false
            }
        }
    }

    async fn queue_pop(&self, queue: &str, timeout_secs: u64) -> Option<Value> {
        let mut conn = self.conn();
        match conn
            .brpop::<_, Option<(String, String)>>(queue, timeout_secs as f64)
            .await
        {
            Ok(Some((_, raw))) => decode(&raw),
            Ok(None) => None,
            Err(error) => {
                warn!(queue, %error, "redis BRPOP failed");
                // Back off so a dead broker does not spin the worker loop.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                None
            }
        }
    }

    async fn queue_remove(&self, queue: &str, payload: &Value) -> bool {
        let mut conn = self.conn();
        match conn.lrem::<_, _, i64>(queue, 1, payload.to_string()).await {
            Ok(removed) => removed > 0,
            Err(error) => {
                warn!(queue, %error, "redis LREM failed");
                false
            }
        }
    }

    async fn queue_remove_matching(&self, queue: &str, field: &str, value: &str) -> bool {
        let mut conn = self.conn();
        let items: Vec<String> = match conn.lrange(queue, 0, -1).await {
            Ok(items) => items,
            Err(error) => {
                warn!(queue, %error, "redis LRANGE failed");
                return false;
            }
        };
        for raw in items {
            let Some(item) = decode(&raw) else { continue };
            if item.get(field).and_then(Value::as_str) == Some(value) {
                return match conn.lrem::<_, _, i64>(queue, 1, raw).await {
                    Ok(removed) => removed > 0,
                    Err(error) => {
                        warn!(queue, %error, "redis LREM failed");
                        false
                    }
                };
            }
        }
        false
    }
}
