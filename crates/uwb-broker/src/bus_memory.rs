//! In-memory implementation of the `Bus` port for tests and single-process
//! development runs. Semantics mirror the Redis bus: lazy key expiry,
//! last-writer-wins hashes, broadcast pub/sub, FIFO queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use uwb_core::ports::Bus;

#[derive(Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|deadline| Instant::now() < deadline)
    }
}

/// In-memory bus; every operation is process-local.
#[derive(Default)]
pub struct MemoryBus {
    keys: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashMap<String, Value>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn ping(&self) -> bool {
        true
    }

    async fn get_json(&self, key: &str) -> Option<Value> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        match keys.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                keys.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set_json(&self, key: &str, value: &Value) {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: None,
            },
        );
    }

    async fn set_json_ex(&self, key: &str, value: &Value, ttl_secs: u64) {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
        self.hashes.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    async fn hash_get_all(&self, key: &str) -> HashMap<String, Value> {
        self.hashes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    async fn hash_set(&self, key: &str, field: &str, value: &Value) {
        self.hashes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.clone());
    }

    async fn hash_delete(&self, key: &str, field: &str) {
        if let Some(map) = self
            .hashes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(key)
        {
            map.remove(field);
        }
    }

    async fn hash_increment_by(&self, key: &str, field: &str, delta: i64) {
        let mut hashes = self.hashes.lock().unwrap_or_else(|p| p.into_inner());
        let map = hashes.entry(key.to_string()).or_default();
        let current = map.get(field).and_then(Value::as_i64).unwrap_or(0);
        map.insert(field.to_string(), Value::from(current + delta));
    }

    async fn expire(&self, key: &str, ttl_secs: u64) {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = keys.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        let keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<String> = keys
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && entry.live())
            .map(|(k, _)| k.clone())
            .collect();
        let hashes = self.hashes.lock().unwrap_or_else(|p| p.into_inner());
        out.extend(hashes.keys().filter(|k| k.starts_with(prefix)).cloned());
        out.sort();
        out.dedup();
        out
    }

    async fn publish(&self, channel: &str, payload: &Value) {
        // No listeners is fine.
        let _ = self.sender_for(channel).send(payload.clone());
    }

    async fn subscribe(&self, channel: &str) -> mpsc::Receiver<Value> {
        let mut broadcast_rx = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(value) = broadcast_rx.recv().await {
                if tx.send(value).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn queue_push(&self, queue: &str, payload: &Value) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.clone());
        true
    }

    async fn queue_pop(&self, queue: &str, timeout_secs: u64) -> Option<Value> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            {
                let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(item) = queues.get_mut(queue).and_then(VecDeque::pop_front) {
                    return Some(item);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn queue_remove(&self, queue: &str, payload: &Value) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let Some(items) = queues.get_mut(queue) else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item != payload);
        items.len() < before
    }

    async fn queue_remove_matching(&self, queue: &str, field: &str, value: &str) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let Some(items) = queues.get_mut(queue) else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item.get(field).and_then(Value::as_str) != Some(value));
        items.len() < before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn keys_expire_lazily() {
        let bus = MemoryBus::new();
        bus.set_json_ex("k", &json!({"v": 1}), 0).await;
        assert!(bus.get_json("k").await.is_none());

        bus.set_json("k", &json!({"v": 2})).await;
        assert_eq!(bus.get_json("k").await.unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn hash_ops_and_increment() {
        let bus = MemoryBus::new();
        bus.hash_set("h", "a", &json!({"x": 1})).await;
        bus.hash_increment_by("h", "count", 3).await;
        bus.hash_increment_by("h", "count", 2).await;

        let all = bus.hash_get_all("h").await;
        assert_eq!(all["count"], json!(5));
        assert_eq!(all["a"]["x"], 1);

        bus.delete("h").await;
        assert!(bus.hash_get_all("h").await.is_empty());
    }

    #[tokio::test]
    async fn pubsub_delivers_to_live_subscribers() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("chan").await;
        bus.publish("chan", &json!({"type": "progress"})).await;

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received["type"], "progress");
    }

    #[tokio::test]
    async fn queue_is_fifo_and_supports_remove() {
        let bus = MemoryBus::new();
        bus.queue_push("q", &json!({"n": 1})).await;
        bus.queue_push("q", &json!({"n": 2})).await;
        bus.queue_push("q", &json!({"n": 3})).await;

        assert!(bus.queue_remove("q", &json!({"n": 2})).await);
        assert!(!bus.queue_remove("q", &json!({"n": 9})).await);

        assert_eq!(bus.queue_pop("q", 1).await.unwrap()["n"], 1);
        assert_eq!(bus.queue_pop("q", 1).await.unwrap()["n"], 3);
        assert!(bus.queue_pop("q", 0).await.is_none());
    }
}
