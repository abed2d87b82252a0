//! Ingest API client
//!
//! [`SyncApi`] is the seam the workers talk through; [`HttpSyncApi`] is the
//! reqwest implementation. Protocol errors arrive in-band (HTTP 200 with
//! `success: false`) and are mapped to [`SyncError`] by their `code`.

use async_trait::async_trait;
use callsync_common::api::{
    parse_envelope, BatchSyncRequest, BatchSyncResponse, CheckRecordingsRequest, CheckRecordingsResponse,
    FetchConfigRequest, FetchConfigResponse, FetchUpdatesRequest, FetchUpdatesResponse, FinalizeUploadRequest,
    FinalizeUploadResponse, StartCallRequest, StartCallResponse, UpdateNoteRequest, UpdateNoteResponse,
    UploadChunkQuery, UploadChunkResponse, VerifyPairingRequest, VerifyPairingResponse,
};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};

/// `callsync-client/{version}+{git hash}`
const USER_AGENT: &str = concat!("callsync-client/", env!("CARGO_PKG_VERSION"), "+", env!("GIT_HASH"));

/// Timeout for the connectivity probe
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn verify_pairing(&self, req: &VerifyPairingRequest) -> Result<VerifyPairingResponse>;

    async fn fetch_config(&self, req: &FetchConfigRequest) -> Result<FetchConfigResponse>;

    async fn start_call(&self, req: &StartCallRequest) -> Result<StartCallResponse>;

    async fn batch_sync_calls(&self, req: &BatchSyncRequest) -> Result<BatchSyncResponse>;

    async fn fetch_updates(&self, req: &FetchUpdatesRequest) -> Result<FetchUpdatesResponse>;

    async fn update_note(&self, req: &UpdateNoteRequest) -> Result<UpdateNoteResponse>;

    async fn upload_chunk(&self, query: &UploadChunkQuery, chunk: Vec<u8>) -> Result<UploadChunkResponse>;

    async fn finalize_upload(&self, req: &FinalizeUploadRequest) -> Result<FinalizeUploadResponse>;

    async fn check_recordings_status(&self, req: &CheckRecordingsRequest) -> Result<CheckRecordingsResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpSyncApi {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpSyncApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the server answers `/health`
    pub async fn ping(&self) -> bool {
        match self
            .http_client
            .get(self.url("/health"))
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        }
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.http_client.post(self.url(path)).json(body).send().await?;
        decode(path, response).await
    }
}

/// Unwrap an envelope, classifying failures that never reached a handler
async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) if status.is_server_error() => {
            return Err(SyncError::Server(format!("{} returned {}", path, status)));
        }
        Err(_) if !status.is_success() => {
            return Err(SyncError::Validation(format!("{} returned {}: {}", path, status, body.trim())));
        }
        Err(e) => return Err(SyncError::Server(format!("{} returned malformed JSON: {}", path, e))),
    };

    parse_envelope(value).map_err(|failure| {
        debug!(path, %status, "Request failed: {}", failure);
        SyncError::from(failure)
    })
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn verify_pairing(&self, req: &VerifyPairingRequest) -> Result<VerifyPairingResponse> {
        self.post_json("/api/verify_pairing_code", req).await
    }

    async fn fetch_config(&self, req: &FetchConfigRequest) -> Result<FetchConfigResponse> {
        self.post_json("/api/fetch_config", req).await
    }

    async fn start_call(&self, req: &StartCallRequest) -> Result<StartCallResponse> {
        self.post_json("/api/start_call", req).await
    }

    async fn batch_sync_calls(&self, req: &BatchSyncRequest) -> Result<BatchSyncResponse> {
        self.post_json("/api/batch_sync_calls", req).await
    }

    async fn fetch_updates(&self, req: &FetchUpdatesRequest) -> Result<FetchUpdatesResponse> {
        self.post_json("/api/fetch_updates", req).await
    }

    async fn update_note(&self, req: &UpdateNoteRequest) -> Result<UpdateNoteResponse> {
        self.post_json("/api/update_note", req).await
    }

    async fn upload_chunk(&self, query: &UploadChunkQuery, chunk: Vec<u8>) -> Result<UploadChunkResponse> {
        // reqwest form-encodes the query, so a `+` in the id travels as %2B
        let response = self
            .http_client
            .post(self.url("/api/upload_chunk"))
            .query(query)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(chunk)
            .send()
            .await?;
        decode("/api/upload_chunk", response).await
    }

    async fn finalize_upload(&self, req: &FinalizeUploadRequest) -> Result<FinalizeUploadResponse> {
        self.post_json("/api/finalize_upload", req).await
    }

    async fn check_recordings_status(&self, req: &CheckRecordingsRequest) -> Result<CheckRecordingsResponse> {
        self.post_json("/api/check_recordings_status", req).await
    }
}
