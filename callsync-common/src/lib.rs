//! # callsync common library
//!
//! Shared code for the call-and-recording synchronization pipeline:
//! - Call domain types (call type, composite id, phone normalisation)
//! - Per-call sync state machines shared by both client workers
//! - Wire types for the ingest API (requests, responses, JSON envelope)
//! - Configuration loading and root folder resolution
//! - SQLite pool setup used by the server store and the local call store

pub mod api;
pub mod call;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod status;
pub mod time;

pub use call::{composite_id, normalize_phone_number, CallType, SimSelection};
pub use error::{Error, Result};
pub use status::{RecordingEvent, RecordingSyncStatus, SyncStatus};
