//! HTTP latency histograms in the shared store.
//!
//! One hash per `(method, route_template)` holds a count, a latency sum,
//! fixed bucket counters, 5xx count and the last observation. Keys expire
//! after 7 days of inactivity. Quantiles come from the bucket CDF by
//! cumulative sum.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use uwb_core::ports::Bus;

const METRICS_PREFIX: &str = "un1ca:http_metrics:";
const METRICS_TTL_SECS: u64 = 7 * 24 * 3600;

/// Bucket upper bounds in milliseconds; the last bucket is +inf.
const BUCKETS_MS: [u64; 12] = [10, 25, 50, 100, 200, 350, 500, 750, 1000, 2000, 5000, u64::MAX];

fn bucket_field(bound: u64) -> String {
    if bound == u64::MAX {
        "le_inf".to_string()
    } else {
        format!("le_{bound}")
    }
}

/// Aggregated view of one route's histogram.
#[derive(Debug, Clone, Serialize)]
pub struct RouteMetrics {
    pub method: String,
    pub route: String,
    pub count: i64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub err_5xx: i64,
    pub last_status: i64,
    pub last_ms: i64,
}

/// Recorder + reader for the per-route latency hashes.
#[derive(Clone)]
pub struct HttpMetrics {
    bus: Arc<dyn Bus>,
}

impl HttpMetrics {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    fn key(method: &str, route: &str) -> String {
        format!("{METRICS_PREFIX}{method} {route}")
    }

    /// Record one observation. Called from middleware on every response.
    pub async fn record(&self, method: &str, route: &str, status: u16, elapsed_ms: u64) {
        let key = Self::key(method, route);
        self.bus.hash_increment_by(&key, "count", 1).await;
        self.bus
            .hash_increment_by(&key, "sum_ms", elapsed_ms as i64)
            .await;

        for bound in BUCKETS_MS {
            if elapsed_ms <= bound {
                self.bus.hash_increment_by(&key, &bucket_field(bound), 1).await;
                break;
            }
        }

        if status >= 500 {
            self.bus.hash_increment_by(&key, "err_5xx", 1).await;
        }
        self.bus.hash_set(&key, "last_status", &json!(status)).await;
        self.bus.hash_set(&key, "last_ms", &json!(elapsed_ms)).await;
        self.bus.expire(&key, METRICS_TTL_SECS).await;
    }

    /// All route histograms, sorted by route.
    pub async fn summary(&self) -> Vec<RouteMetrics> {
        let mut out = Vec::new();
        for key in self.bus.scan_prefix(METRICS_PREFIX).await {
            let fields = self.bus.hash_get_all(&key).await;
            if fields.is_empty() {
                continue;
            }
            let name = key.trim_start_matches(METRICS_PREFIX);
            let (method, route) = name.split_once(' ').unwrap_or((name, ""));

            let as_i64 =
                |field: &str| fields.get(field).and_then(Value::as_i64).unwrap_or(0);
            let count = as_i64("count");
            let sum_ms = as_i64("sum_ms");

            let cdf: Vec<(u64, i64)> = BUCKETS_MS
                .iter()
                .map(|bound| (*bound, as_i64(&bucket_field(*bound))))
                .collect();

            out.push(RouteMetrics {
                method: method.to_string(),
                route: route.to_string(),
                count,
                avg_ms: if count > 0 { sum_ms as f64 / count as f64 } else { 0.0 },
                p50_ms: quantile(&cdf, count, 0.50),
                p90_ms: quantile(&cdf, count, 0.90),
                p99_ms: quantile(&cdf, count, 0.99),
                err_5xx: as_i64("err_5xx"),
                last_status: as_i64("last_status"),
                last_ms: as_i64("last_ms"),
            });
        }
        out.sort_by(|a, b| a.route.cmp(&b.route).then(a.method.cmp(&b.method)));
        out
    }
}

/// Quantile on the bucket CDF by cumulative sum. The +inf bucket reports the
/// largest finite bound.
fn quantile(cdf: &[(u64, i64)], count: i64, q: f64) -> f64 {
    if count <= 0 {
        return 0.0;
    }
    let target = (count as f64 * q).ceil() as i64;
    let mut cumulative = 0;
    for (bound, bucket_count) in cdf {
        cumulative += bucket_count;
        if cumulative >= target {
            return if *bound == u64::MAX {
                BUCKETS_MS[BUCKETS_MS.len() - 2] as f64
            } else {
                *bound as f64
            };
        }
    }
    BUCKETS_MS[BUCKETS_MS.len() - 2] as f64
}
