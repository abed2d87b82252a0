//! Client configuration
//!
//! Loaded from `client.toml` (path from `--config`, else
//! `~/.config/callsync/client.toml`). Every key is optional.

use callsync_common::config::{load_toml, resolve_root_folder};
use callsync_common::SimSelection;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const ROOT_ENV_VAR: &str = "CALLSYNC_CLIENT_ROOT";
pub const CONFIG_FILE_NAME: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Ingest API origin, e.g. `https://calls.example.com`
    pub server_url: String,
    /// Folder holding the local database; resolved like the server root
    pub root_folder: Option<PathBuf>,
    /// Overrides `<root_folder>/callsync-client.db`
    pub database_path: Option<PathBuf>,
    pub device_id: String,
    pub device_model: Option<String>,
    /// Where the dialer writes call recordings
    pub recording_dir: Option<PathBuf>,
    /// JSON export of the OS call log
    pub call_log_path: Option<PathBuf>,
    /// Digits only, e.g. `91`
    pub default_country_code: Option<String>,
    pub sim_selection: SimSelection,
    pub sim1_subscription_id: Option<i64>,
    pub sim2_subscription_id: Option<i64>,
    /// `YYYY-MM-DD`; calls before this date are never tracked
    pub tracking_start_date: Option<String>,
    pub metadata_interval_secs: u64,
    pub recording_interval_secs: u64,
    pub recording_batch_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5780".to_string(),
            root_folder: None,
            database_path: None,
            device_id: String::new(),
            device_model: None,
            recording_dir: None,
            call_log_path: None,
            default_country_code: None,
            sim_selection: SimSelection::Both,
            sim1_subscription_id: None,
            sim2_subscription_id: None,
            tracking_start_date: None,
            metadata_interval_secs: 15 * 60,
            recording_interval_secs: 15 * 60,
            recording_batch_size: 10,
            request_timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Read `path`, or fall back to defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: ClientConfig = match path {
            Some(p) => load_toml(p)?,
            None => ClientConfig::default(),
        };
        config.server_url = config.server_url.trim_end_matches('/').to_string();
        if config.root_folder.is_none() {
            config.root_folder = Some(resolve_root_folder(None, ROOT_ENV_VAR, path));
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        self.root_folder
            .clone()
            .unwrap_or_else(|| resolve_root_folder(None, ROOT_ENV_VAR, None))
            .join("callsync-client.db")
    }

    /// Start of the tracking window as epoch millis (UTC midnight); 0 when unset
    pub fn tracking_start_millis(&self) -> Result<i64> {
        match self.tracking_start_date.as_deref() {
            None => Ok(0),
            Some(date) => parse_tracking_date(date),
        }
    }

    pub fn metadata_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_interval_secs.max(1))
    }

    pub fn recording_interval(&self) -> Duration {
        Duration::from_secs(self.recording_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// `YYYY-MM-DD` to epoch millis at UTC midnight
pub fn parse_tracking_date(date: &str) -> Result<i64> {
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| SyncError::Config(format!("Invalid tracking start date '{}': {}", date, e)))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| SyncError::Config(format!("Invalid tracking start date '{}'", date)))?;
    Ok(Utc.from_utc_datetime(&midnight).timestamp_millis())
}
