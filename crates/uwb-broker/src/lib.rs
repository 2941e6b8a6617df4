//! Shared-store adapters: the Redis bus (with an in-memory twin for tests),
//! the durable job queue, progress fan-out stores, TTL/serve-stale caches and
//! the HTTP latency metrics sink.

mod bus_memory;
mod bus_redis;
mod cache;
mod metrics;
mod progress;
mod queue;

pub use bus_memory::MemoryBus;
pub use bus_redis::RedisBus;
pub use cache::{CachePolicy, StaleCache, dir_size_cache_key};
pub use metrics::{HttpMetrics, RouteMetrics};
pub use progress::{BuildProgressStore, FirmwareProgressStore, RepoProgressStore};
pub use queue::{JobQueue, QUEUE_BUILDS, QUEUE_CONTROLS, QueueItem};
