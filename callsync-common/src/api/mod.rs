//! Wire contract of the ingest API
//!
//! Shared by the axum handlers in `callsync-server` and the HTTP client in
//! `callsync-client`. No HTTP framework types live here.

pub mod envelope;
pub mod types;

pub use envelope::{parse_envelope, Envelope, ErrorCode, ErrorEnvelope, RemoteFailure};
pub use types::*;
