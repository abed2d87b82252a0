//! OS call-log access
//!
//! The ingestor reads entries through [`CallLogSource`]. On a desktop build
//! the OS log arrives as a JSON export using the platform column names:
//!
//! ```json
//! [{"number": "+15550001111", "type": 1, "date": 1709280000000,
//!   "duration": 42, "name": "Alice", "subscription_id": 1}]
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::Result;

/// One raw OS call-log row
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallLogEntry {
    pub number: String,
    /// Platform call type code (1 incoming, 2 outgoing, 3 missed, 5 rejected, 6 blocked)
    #[serde(rename = "type")]
    pub type_code: i32,
    /// Call start, epoch millis
    #[serde(rename = "date")]
    pub timestamp_ms: i64,
    /// Seconds
    #[serde(default)]
    pub duration: i64,
    /// Cached contact name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<i64>,
}

#[async_trait]
pub trait CallLogSource: Send + Sync {
    /// Entries that started at or after `since_ms`
    async fn entries_since(&self, since_ms: i64) -> Result<Vec<CallLogEntry>>;
}

/// Call log exported as a JSON array file
#[derive(Debug, Clone)]
pub struct FileCallLogSource {
    path: PathBuf,
}

impl FileCallLogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CallLogSource for FileCallLogSource {
    async fn entries_since(&self, since_ms: i64) -> Result<Vec<CallLogEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Call log export {} not found", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let entries: Vec<CallLogEntry> = serde_json::from_str(&content)?;
        let total = entries.len();
        let entries: Vec<CallLogEntry> = entries.into_iter().filter(|e| e.timestamp_ms >= since_ms).collect();
        debug!(total, selected = entries.len(), since_ms, "Read call log export");
        Ok(entries)
    }
}
