//! Progress fan-out stores: per-key snapshot maps plus delta publications.
//!
//! Firmware and build progress are hashes keyed by `MODEL_CSC` / job id; the
//! repo stream is a single slot because only one repo operation runs at a
//! time. Every write overwrites the snapshot and publishes the same payload
//! as a delta; subscribers get a snapshot on connect and deltas afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use uwb_core::ports::Bus;
use uwb_core::progress::{
    BUILD_PROGRESS_CHANNEL, BUILD_PROGRESS_KEY, FIRMWARE_PROGRESS_CHANNEL, FIRMWARE_PROGRESS_KEY,
    ProgressUpdate, REPO_PROGRESS_CHANNEL, REPO_PROGRESS_KEY,
};

fn to_value(update: &ProgressUpdate) -> Value {
    serde_json::to_value(update).unwrap_or_else(|_| Value::Null)
}

/// Firmware download/extract progress, keyed by `MODEL_CSC`.
#[derive(Clone)]
pub struct FirmwareProgressStore {
    bus: Arc<dyn Bus>,
}

impl FirmwareProgressStore {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub async fn list(&self) -> HashMap<String, Value> {
        self.bus.hash_get_all(FIRMWARE_PROGRESS_KEY).await
    }

    pub async fn set(&self, fw_key: &str, mut update: ProgressUpdate) {
        update.fw_key = Some(fw_key.to_string());
        update.updated_at = Some(Utc::now().to_rfc3339());
        let payload = to_value(&update);
        self.bus.hash_set(FIRMWARE_PROGRESS_KEY, fw_key, &payload).await;
        self.bus.publish(FIRMWARE_PROGRESS_CHANNEL, &payload).await;
    }

    pub async fn remove(&self, fw_key: &str) {
        let mut tombstone = ProgressUpdate::removed();
        tombstone.fw_key = Some(fw_key.to_string());
        self.bus.hash_delete(FIRMWARE_PROGRESS_KEY, fw_key).await;
        self.bus.publish(FIRMWARE_PROGRESS_CHANNEL, &to_value(&tombstone)).await;
    }

    /// Startup reset: drop the whole snapshot map.
    pub async fn clear(&self) {
        self.bus.delete(FIRMWARE_PROGRESS_KEY).await;
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<Value> {
        self.bus.subscribe(FIRMWARE_PROGRESS_CHANNEL).await
    }
}

/// Build heartbeat/progress, keyed by job id.
#[derive(Clone)]
pub struct BuildProgressStore {
    bus: Arc<dyn Bus>,
}

impl BuildProgressStore {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub async fn list(&self) -> HashMap<String, Value> {
        self.bus.hash_get_all(BUILD_PROGRESS_KEY).await
    }

    pub async fn set(&self, job_id: &str, mut update: ProgressUpdate) {
        update.job_id = Some(job_id.to_string());
        update.updated_at = Some(Utc::now().to_rfc3339());
        let payload = to_value(&update);
        self.bus.hash_set(BUILD_PROGRESS_KEY, job_id, &payload).await;
        self.bus.publish(BUILD_PROGRESS_CHANNEL, &payload).await;
    }

    pub async fn remove(&self, job_id: &str) {
        let mut tombstone = ProgressUpdate::removed();
        tombstone.job_id = Some(job_id.to_string());
        self.bus.hash_delete(BUILD_PROGRESS_KEY, job_id).await;
        self.bus.publish(BUILD_PROGRESS_CHANNEL, &to_value(&tombstone)).await;
    }

    pub async fn clear(&self) {
        self.bus.delete(BUILD_PROGRESS_KEY).await;
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<Value> {
        self.bus.subscribe(BUILD_PROGRESS_CHANNEL).await
    }
}

/// Repo operation progress: one slot, not a map.
#[derive(Clone)]
pub struct RepoProgressStore {
    bus: Arc<dyn Bus>,
}

impl RepoProgressStore {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub async fn get(&self) -> Option<Value> {
        self.bus.get_json(REPO_PROGRESS_KEY).await
    }

    pub async fn set(&self, mut update: ProgressUpdate) {
        update.updated_at = Some(Utc::now().to_rfc3339());
        let payload = to_value(&update);
        self.bus.set_json(REPO_PROGRESS_KEY, &payload).await;
        self.bus.publish(REPO_PROGRESS_CHANNEL, &payload).await;
    }

    pub async fn clear(&self) {
        self.bus.delete(REPO_PROGRESS_KEY).await;
        self.bus
            .publish(REPO_PROGRESS_CHANNEL, &to_value(&ProgressUpdate::removed()))
            .await;
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<Value> {
        self.bus.subscribe(REPO_PROGRESS_CHANNEL).await
    }
}
