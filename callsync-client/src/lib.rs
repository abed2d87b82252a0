//! callsync-client library - device side of the sync pipeline
//!
//! Reads the OS call log into a local SQLite store, pushes call metadata
//! to the ingest server on a fast path and uploads recordings in chunks on
//! a slow path. Both paths are driven by [`scheduler::SyncScheduler`].

pub mod api_client;
pub mod call_log;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingestor;
pub mod locator;
pub mod pairing;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use crate::api_client::{HttpSyncApi, SyncApi};
pub use crate::error::{Result, SyncError};
pub use crate::pairing::pair_device;
pub use crate::scheduler::{SchedulerHandle, SchedulerIntervals, SyncScheduler, SyncTrigger};
pub use crate::store::{CallRecord, LocalCallStore, PersonRecord};
pub use crate::workers::RunMode;

/// Version, git hash, build time and profile captured by build.rs
pub fn build_id() -> String {
    format!(
        "v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    )
}
