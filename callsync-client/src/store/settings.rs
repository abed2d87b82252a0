//! Persisted client state in the `settings` key/value table

use callsync_common::api::{Credentials, EmployeeSettings};
use callsync_common::db::{delete_setting, get_setting, get_setting_or, set_setting};
use std::collections::HashSet;
use std::path::PathBuf;

use super::LocalCallStore;
use crate::error::{Result, SyncError};

pub const KEY_ORG_ID: &str = "org_id";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_PAIRED_DEVICE_ID: &str = "paired_device_id";
pub const KEY_LAST_SYNC_TIME: &str = "last_sync_time";
pub const KEY_RECORDING_DIR: &str = "recording_dir";
pub const KEY_EXCLUDED_NUMBERS: &str = "excluded_numbers";
pub const KEY_CALL_TRACK_ENABLED: &str = "call_track_enabled";
pub const KEY_CALL_RECORD_ENABLED: &str = "call_record_enabled";
/// Tracking start used by the previous ingest pass
pub const KEY_INGEST_TRACKING_START: &str = "ingest_tracking_start";

/// Identity this device is paired as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingIdentity {
    pub org_id: String,
    pub user_id: i64,
    pub device_id: String,
}

impl PairingIdentity {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            org_id: self.org_id.clone(),
            user_id: self.user_id,
            device_id: self.device_id.clone(),
        }
    }
}

impl LocalCallStore {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(get_setting(&self.pool, key).await?)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        Ok(set_setting(&self.pool, key, value).await?)
    }

    pub async fn pairing_identity(&self) -> Result<Option<PairingIdentity>> {
        let org_id = self.get_setting(KEY_ORG_ID).await?;
        let user_id = self.get_setting(KEY_USER_ID).await?;
        let device_id = self.get_setting(KEY_PAIRED_DEVICE_ID).await?;
        match (org_id, user_id, device_id) {
            (Some(org_id), Some(user_id), Some(device_id)) => {
                let user_id = user_id
                    .parse()
                    .map_err(|_| SyncError::Internal(format!("Stored user_id '{}' is not a number", user_id)))?;
                Ok(Some(PairingIdentity {
                    org_id,
                    user_id,
                    device_id,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Identity or [`SyncError::NotPaired`]
    pub async fn require_identity(&self) -> Result<PairingIdentity> {
        self.pairing_identity().await?.ok_or(SyncError::NotPaired)
    }

    /// Store a new identity. Switching identity resets the delta cursor.
    pub async fn set_pairing_identity(&self, identity: &PairingIdentity) -> Result<()> {
        let previous = self.pairing_identity().await?;
        let same_account = previous
            .as_ref()
            .is_some_and(|p| p.org_id == identity.org_id && p.user_id == identity.user_id);

        self.set_setting(KEY_ORG_ID, &identity.org_id).await?;
        self.set_setting(KEY_USER_ID, &identity.user_id.to_string()).await?;
        self.set_setting(KEY_PAIRED_DEVICE_ID, &identity.device_id).await?;
        if !same_account {
            delete_setting(&self.pool, KEY_LAST_SYNC_TIME).await?;
        }
        Ok(())
    }

    pub async fn clear_pairing_identity(&self) -> Result<()> {
        for key in [KEY_ORG_ID, KEY_USER_ID, KEY_PAIRED_DEVICE_ID] {
            delete_setting(&self.pool, key).await?;
        }
        Ok(())
    }

    /// Server clock of the last successful pull; 0 before the first one
    pub async fn last_sync_time(&self) -> Result<i64> {
        Ok(get_setting_or(&self.pool, KEY_LAST_SYNC_TIME, 0i64).await?)
    }

    pub async fn set_last_sync_time(&self, server_time: i64) -> Result<()> {
        self.set_setting(KEY_LAST_SYNC_TIME, &server_time.to_string()).await
    }

    pub async fn recording_dir(&self) -> Result<Option<PathBuf>> {
        Ok(self.get_setting(KEY_RECORDING_DIR).await?.map(PathBuf::from))
    }

    pub async fn set_recording_dir(&self, dir: &std::path::Path) -> Result<()> {
        self.set_setting(KEY_RECORDING_DIR, &dir.to_string_lossy()).await
    }

    /// Org-wide exclusions from the last config fetch plus the user's own
    pub async fn excluded_numbers(&self) -> Result<HashSet<String>> {
        let mut numbers: HashSet<String> = match self.get_setting(KEY_EXCLUDED_NUMBERS).await? {
            Some(json) => serde_json::from_str::<Vec<String>>(&json)?.into_iter().collect(),
            None => HashSet::new(),
        };
        numbers.extend(self.personally_excluded_numbers().await?);
        Ok(numbers)
    }

    pub async fn set_excluded_numbers(&self, numbers: &[String]) -> Result<()> {
        let json = serde_json::to_string(numbers)?;
        self.set_setting(KEY_EXCLUDED_NUMBERS, &json).await
    }

    /// Persist the tracking flags handed out by the server
    pub async fn apply_employee_settings(&self, settings: &EmployeeSettings) -> Result<()> {
        self.set_setting(KEY_CALL_TRACK_ENABLED, &settings.call_track.to_string())
            .await?;
        self.set_setting(KEY_CALL_RECORD_ENABLED, &settings.call_record_crm.to_string())
            .await
    }

    pub async fn call_track_enabled(&self) -> Result<bool> {
        Ok(get_setting_or(&self.pool, KEY_CALL_TRACK_ENABLED, true).await?)
    }

    pub async fn call_record_enabled(&self) -> Result<bool> {
        Ok(get_setting_or(&self.pool, KEY_CALL_RECORD_ENABLED, true).await?)
    }

    pub async fn ingest_tracking_start(&self) -> Result<Option<i64>> {
        Ok(self
            .get_setting(KEY_INGEST_TRACKING_START)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    pub async fn set_ingest_tracking_start(&self, start_ms: i64) -> Result<()> {
        self.set_setting(KEY_INGEST_TRACKING_START, &start_ms.to_string())
            .await
    }
}
