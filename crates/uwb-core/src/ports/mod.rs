//! Ports: the traits adapters implement.
//!
//! No `sqlx` or `redis` types appear in these signatures; stores work with
//! domain types and the bus works with JSON values, so tests can inject
//! in-memory implementations.

mod bus;
mod jobs;
mod settings;

pub use bus::Bus;
pub use jobs::{JobFinish, JobStore};
pub use settings::{SettingsStore, settings_keys};
