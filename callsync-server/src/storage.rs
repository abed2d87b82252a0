//! Recording storage: temp chunks and assembled files
//!
//! Layout under the root folder:
//! - `tmp_chunks/{org}/{unique_id}/{index}` one file per received chunk
//! - `public/{org}/{employee}/{YYYY_MM}/{YYYYMMDD}/{file}` assembled recordings

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct RecordingStorage {
    root: PathBuf,
}

impl RecordingStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn public_dir(&self) -> PathBuf {
        self.root.join("public")
    }

    pub fn chunk_root(&self) -> PathBuf {
        self.root.join("tmp_chunks")
    }

    fn chunk_dir(&self, org_id: &str, unique_id: &str) -> PathBuf {
        self.chunk_root().join(org_id).join(unique_id)
    }

    /// Store one chunk, replacing any earlier copy of the same index.
    ///
    /// Written to a temp name and renamed into place, so a concurrent reader
    /// sees either the old or the new chunk, never a partial one.
    pub async fn store_chunk(&self, org_id: &str, unique_id: &str, index: u32, bytes: &[u8]) -> ApiResult<u64> {
        check_component("org_id", org_id)?;
        check_component("unique_id", unique_id)?;

        let dir = self.chunk_dir(org_id, unique_id);
        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!("{}.tmp-{}", index, uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, dir.join(index.to_string())).await?;

        debug!(unique_id, index, bytes = bytes.len(), "Stored chunk");
        Ok(bytes.len() as u64)
    }

    /// Concatenate chunks `0..total_chunks` into `public/{relative}`, then
    /// delete the chunk directory.
    ///
    /// Fails with `ChunkMissing` naming the first absent index; in that case
    /// nothing is written and the chunks are kept. A concurrent finalize that
    /// consumes the chunks mid-copy also surfaces as `ChunkMissing`.
    pub async fn assemble(&self, org_id: &str, unique_id: &str, total_chunks: u32, relative: &Path) -> ApiResult<u64> {
        check_component("org_id", org_id)?;
        check_component("unique_id", unique_id)?;
        if total_chunks == 0 {
            return Err(ApiError::Validation("total_chunks must be at least 1".to_string()));
        }

        let dir = self.chunk_dir(org_id, unique_id);
        for index in 0..total_chunks {
            if !fs::try_exists(dir.join(index.to_string())).await? {
                return Err(ApiError::ChunkMissing(index));
            }
        }

        let dest = self.public_dir().join(relative);
        let parent = dest
            .parent()
            .ok_or_else(|| ApiError::Internal(format!("Invalid recording path {}", dest.display())))?;
        fs::create_dir_all(parent).await?;

        let partial = parent.join(format!(".{}.partial", uuid::Uuid::new_v4()));
        let mut out = fs::File::create(&partial).await?;
        let written = match copy_chunks(&dir, total_chunks, &mut out).await {
            Ok(written) => written,
            Err(e) => {
                drop(out);
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), "Could not remove partial recording: {}", cleanup);
                }
                return Err(e);
            }
        };
        out.sync_all().await?;
        drop(out);
        fs::rename(&partial, &dest).await?;

        match fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        debug!(unique_id, total_chunks, bytes = written, path = %dest.display(), "Assembled recording");
        Ok(written)
    }
}

/// Append chunks `0..total_chunks` to `out`
async fn copy_chunks(dir: &Path, total_chunks: u32, out: &mut fs::File) -> ApiResult<u64> {
    let mut written = 0u64;
    for index in 0..total_chunks {
        let mut chunk = match fs::File::open(dir.join(index.to_string())).await {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::ChunkMissing(index)),
            Err(e) => return Err(e.into()),
        };
        written += tokio::io::copy(&mut chunk, out).await?;
    }
    Ok(written)
}

/// Path of an assembled recording relative to `public/`:
/// `{org}/{employee}/{YYYY_MM}/{YYYYMMDD}/{callerDigits}_{YYYYMMDD_HHMMSS}_{duration}.{ext}`
pub fn recording_relative_path(
    org_id: &str,
    employee_id: i64,
    caller: &str,
    call_time: DateTime<Utc>,
    duration: i64,
    extension: &str,
) -> ApiResult<PathBuf> {
    check_component("org_id", org_id)?;

    let digits = callsync_common::call::phone_digits(caller);
    let caller_part = if digits.is_empty() { "unknown".to_string() } else { digits };
    let file_name = format!(
        "{}_{}_{}.{}",
        caller_part,
        call_time.format("%Y%m%d_%H%M%S"),
        duration.max(0),
        sanitize_extension(extension)
    );

    Ok(PathBuf::from(org_id)
        .join(employee_id.to_string())
        .join(call_time.format("%Y_%m").to_string())
        .join(call_time.format("%Y%m%d").to_string())
        .join(file_name))
}

/// Lowercase alphanumeric extension of at most 5 chars, `mp3` otherwise
pub fn sanitize_extension(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        ext
    } else {
        "mp3".to_string()
    }
}

/// Identifiers used as path components must not escape their directory
fn check_component(field: &str, value: &str) -> ApiResult<()> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ApiError::Validation(format!("{} contains invalid characters", field)))
    }
}
