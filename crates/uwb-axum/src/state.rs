//! Shared application state type.

use std::sync::Arc;

use uwb_broker::{HttpMetrics, StaleCache};
use uwb_runtime::WorkerContext;

/// Everything handlers need: the worker context (config, stores, bus, queue,
/// progress) plus HTTP-side caches and the metrics recorder.
pub struct AppContext {
    pub worker: Arc<WorkerContext>,
    pub metrics: HttpMetrics,
    pub fw_latest: StaleCache,
    pub dir_size: StaleCache,
    pub repo_info: StaleCache,
    pub commit_snapshot: StaleCache,
    pub http: reqwest::Client,
}

impl AppContext {
    pub fn new(worker: Arc<WorkerContext>) -> Self {
        let bus = worker.bus.clone();
        Self {
            metrics: HttpMetrics::new(bus.clone()),
            fw_latest: StaleCache::firmware_latest(bus.clone()),
            dir_size: StaleCache::dir_size(bus.clone()),
            repo_info: StaleCache::repo_info(bus.clone()),
            commit_snapshot: StaleCache::commit_snapshot(bus),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            worker,
        }
    }
}

/// Application state shared across all handlers.
pub type AppState = Arc<AppContext>;
