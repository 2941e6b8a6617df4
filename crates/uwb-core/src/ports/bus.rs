//! Shared key-value / pub-sub / queue bus port.
//!
//! Every operation is infallible from the caller's perspective: broker
//! failures degrade to "cache miss" or "no listeners", and the core never
//! aborts a request because the broker is temporarily unavailable.
//! Implementations log failures themselves.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Liveness probe for health endpoints.
    async fn ping(&self) -> bool;

    async fn get_json(&self, key: &str) -> Option<Value>;

    async fn set_json(&self, key: &str, value: &Value);

    /// Set with a TTL in seconds.
    async fn set_json_ex(&self, key: &str, value: &Value, ttl_secs: u64);

    async fn delete(&self, key: &str);

    /// All fields of a hash, JSON-decoded; undecodable fields are dropped.
    async fn hash_get_all(&self, key: &str) -> HashMap<String, Value>;

    async fn hash_set(&self, key: &str, field: &str, value: &Value);

    async fn hash_delete(&self, key: &str, field: &str);

    async fn hash_increment_by(&self, key: &str, field: &str, delta: i64);

    async fn expire(&self, key: &str, ttl_secs: u64);

    async fn scan_prefix(&self, prefix: &str) -> Vec<String>;

    /// Fire-and-forget publish; no listeners is fine.
    async fn publish(&self, channel: &str, payload: &Value);

    /// Deliver messages from `channel` until the receiver is dropped.
    async fn subscribe(&self, channel: &str) -> mpsc::Receiver<Value>;

    /// Append an item to a named queue.
    async fn queue_push(&self, queue: &str, payload: &Value) -> bool;

    /// Block up to `timeout_secs` for the oldest item of a named queue.
    async fn queue_pop(&self, queue: &str, timeout_secs: u64) -> Option<Value>;

    /// Best-effort removal of a not-yet-popped queue item. Returns whether
    /// anything was removed.
    async fn queue_remove(&self, queue: &str, payload: &Value) -> bool;

    /// Best-effort removal of the queue item whose `field` equals `value`.
    async fn queue_remove_matching(&self, queue: &str, field: &str, value: &str) -> bool;
}
