//! SQLite store implementations for the UN1CA workbench.
//!
//! One table for jobs, one for settings, with forward-only schema evolution:
//! missing columns are appended on startup, nothing is ever dropped or
//! renamed.

mod jobs;
mod settings;
mod setup;

pub use jobs::SqliteJobStore;
pub use settings::SqliteSettingsStore;
pub use setup::setup_database;

#[cfg(any(test, feature = "test-utils"))]
pub use setup::setup_test_database;
