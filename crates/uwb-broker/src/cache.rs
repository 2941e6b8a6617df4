//! TTL caches with a serve-stale rule, backed by the bus.
//!
//! Rule: a fresh entry is returned as is; after a recent fetch failure within
//! the retry window the stale value is served without hitting the network;
//! otherwise the fetcher runs, and on failure an empty entry is recorded
//! while whatever stale value exists is returned.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};

use uwb_core::ports::Bus;

/// Freshness and failure-retry windows for one cache family.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub fresh_ttl: Duration,
    /// When set, a fetch failure within this window keeps serving stale.
    pub stale_retry: Option<Duration>,
}

impl CachePolicy {
    /// Firmware "latest version": 1 h fresh, 60 s failure back-off.
    pub const FIRMWARE_LATEST: Self = Self {
        fresh_ttl: Duration::from_secs(3600),
        stale_retry: Some(Duration::from_secs(60)),
    };
    /// Directory size: 20 min fresh.
    pub const DIR_SIZE: Self = Self {
        fresh_ttl: Duration::from_secs(1200),
        stale_retry: None,
    };
    /// Repo info / commit snapshot: 30 s fresh.
    pub const REPO_INFO: Self = Self {
        fresh_ttl: Duration::from_secs(30),
        stale_retry: None,
    };
}

/// A keyed TTL+stale cache over the bus.
#[derive(Clone)]
pub struct StaleCache {
    bus: Arc<dyn Bus>,
    prefix: &'static str,
    policy: CachePolicy,
}

impl StaleCache {
    pub fn new(bus: Arc<dyn Bus>, prefix: &'static str, policy: CachePolicy) -> Self {
        Self { bus, prefix, policy }
    }

    pub fn firmware_latest(bus: Arc<dyn Bus>) -> Self {
        Self::new(bus, "un1ca:fw_latest:", CachePolicy::FIRMWARE_LATEST)
    }

    pub fn dir_size(bus: Arc<dyn Bus>) -> Self {
        Self::new(bus, "un1ca:dir_size:", CachePolicy::DIR_SIZE)
    }

    pub fn repo_info(bus: Arc<dyn Bus>) -> Self {
        Self::new(bus, "un1ca:repo_info", CachePolicy::REPO_INFO)
    }

    pub fn commit_snapshot(bus: Arc<dyn Bus>) -> Self {
        Self::new(bus, "un1ca:repo_commit", CachePolicy::REPO_INFO)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Drop one entry (cache invalidation after repo mutations).
    pub async fn invalidate(&self, key: &str) {
        self.bus.delete(&self.storage_key(key)).await;
    }

    /// Resolve `key` through the cache, calling `fetch` on miss.
    /// `fetch` returning `None` means "source unavailable".
    pub async fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Option<Value>
    where
        F: Future<Output = Option<Value>> + Send,
    {
        let storage_key = self.storage_key(key);
        let now = Utc::now().timestamp();

        let entry = self.bus.get_json(&storage_key).await;
        let stale_value = entry.as_ref().and_then(|e| e.get("value")).cloned();
        if let Some(entry) = &entry {
            let fetched_at = entry.get("fetched_at").and_then(Value::as_i64).unwrap_or(0);
            if now - fetched_at < self.policy.fresh_ttl.as_secs() as i64 {
                return stale_value.filter(|v| !v.is_null());
            }
            if let Some(retry) = self.policy.stale_retry {
                let error_at = entry.get("error_at").and_then(Value::as_i64);
                if let Some(error_at) = error_at {
                    if now - error_at < retry.as_secs() as i64 {
                        return stale_value.filter(|v| !v.is_null());
                    }
                }
            }
        }

        match fetch.await {
            Some(value) => {
                self.bus
                    .set_json(&storage_key, &json!({"value": value.clone(), "fetched_at": now}))
                    .await;
                value_non_null(value)
            }
            None => {
                // Keep the stale value around for the retry window.
                self.bus
                    .set_json(
                        &storage_key,
                        &json!({
                            "value": stale_value.clone().unwrap_or(Value::Null),
                            "fetched_at": entry
                                .as_ref()
                                .and_then(|e| e.get("fetched_at"))
                                .and_then(Value::as_i64)
                                .unwrap_or(0),
                            "error_at": now,
                        }),
                    )
                    .await;
                stale_value.filter(|v| !v.is_null())
            }
        }
    }
}

fn value_non_null(value: Value) -> Option<Value> {
    if value.is_null() { None } else { Some(value) }
}

/// Cache key for a directory size entry: SHA-1 of the path string.
pub fn dir_size_cache_key(path: &std::path::Path) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(40), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache(policy: CachePolicy) -> StaleCache {
        StaleCache::new(Arc::new(MemoryBus::new()), "test:", policy)
    }

    #[tokio::test]
    async fn fresh_entry_skips_fetch() {
        let cache = cache(CachePolicy::FIRMWARE_LATEST);
        let calls = AtomicU32::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(json!("S901BXXU9FYA1"))
        };

        assert_eq!(
            cache.get_or_fetch("SM-S901B_EUX", fetch()).await.unwrap(),
            json!("S901BXXU9FYA1")
        );
        assert_eq!(
            cache.get_or_fetch("SM-S901B_EUX", fetch()).await.unwrap(),
            json!("S901BXXU9FYA1")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_within_fresh_window_serves_cached_value() {
        let cache = cache(CachePolicy::FIRMWARE_LATEST);
        cache
            .get_or_fetch("KEY", async { Some(json!("v1")) })
            .await
            .unwrap();

        // Fresh, so the failing fetcher is never consulted.
        let got = cache
            .get_or_fetch("KEY", async {
                panic!("must not fetch while fresh");
                #[allow(unreachable_code)]
                None
            })
            .await;
        assert_eq!(got.unwrap(), json!("v1"));
    }

    #[tokio::test]
    async fn failure_records_entry_and_returns_stale() {
        let cache = cache(CachePolicy {
            fresh_ttl: Duration::from_secs(0),
            stale_retry: Some(Duration::from_secs(60)),
        });
        cache.get_or_fetch("KEY", async { Some(json!("v1")) }).await;

        // TTL elapsed; a failing fetch serves the stale value...
        let got = cache.get_or_fetch("KEY", async { None }).await;
        assert_eq!(got.unwrap(), json!("v1"));

        // ...and inside the retry window the fetcher is not hit again.
        let got = cache
            .get_or_fetch("KEY", async {
                panic!("must not fetch inside retry window");
                #[allow(unreachable_code)]
                None
            })
            .await;
        assert_eq!(got.unwrap(), json!("v1"));
    }

    #[tokio::test]
    async fn miss_with_failure_yields_none() {
        let cache = cache(CachePolicy::DIR_SIZE);
        assert!(cache.get_or_fetch("KEY", async { None }).await.is_none());
    }

    #[test]
    fn dir_size_keys_are_stable_sha1() {
        let a = dir_size_cache_key(Path::new("/workspace/out/odin/SM-S901B_EUX"));
        let b = dir_size_cache_key(Path::new("/workspace/out/odin/SM-S901B_EUX"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert_ne!(a, dir_size_cache_key(Path::new("/workspace/out/fw/SM-S901B_EUX")));
    }
}
