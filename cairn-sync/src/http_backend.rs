//! HTTP implementation of [`StorageBackend`].
//!
//! Talks to the storage REST surface with basic auth:
//! - `GET    {base}/1.1/{account}/info/collections`
//! - `GET    {base}/1.1/{account}/storage/{collection}/{id}`
//! - `PUT    {base}/1.1/{account}/storage/{collection}/{id}`
//! - `DELETE {base}/1.1/{account}/storage`

use crate::backend::StorageBackend;
use crate::config::AccountCredentials;
use crate::error::{SyncError, SyncResult};
use crate::types::{CollectionIndex, RemoteRecord};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection settings for [`HttpStorageBackend`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    /// Storage node URL (e.g., "https://storage.example.net").
    pub base_url: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_secs: 30,
        }
    }
}

pub struct HttpStorageBackend {
    client: Client,
    root: String,
    username: String,
    credential: String,
}

impl HttpStorageBackend {
    pub fn new(config: &HttpBackendConfig, credentials: &AccountCredentials) -> SyncResult<Self> {
        if config.base_url.is_empty() {
            return Err(SyncError::Config("base_url must not be empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;

        let root = format!(
            "{}/1.1/{}",
            config.base_url.trim_end_matches('/'),
            urlencoding::encode(&credentials.account_id)
        );

        Ok(Self {
            client,
            root,
            username: credentials.account_id.clone(),
            credential: credentials.credential.clone(),
        })
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/storage/{}/{}",
            self.root,
            urlencoding::encode(collection),
            urlencoding::encode(id)
        )
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> SyncResult<Response> {
        request
            .basic_auth(&self.username, Some(&self.credential))
            .send()
            .await
            .map_err(|e| SyncError::Unreachable(format!("{operation}: {e}")))
    }

    async fn body(response: Response, operation: &str) -> SyncResult<String> {
        response
            .text()
            .await
            .map_err(|e| SyncError::Unreachable(format!("{operation}: reading body failed: {e}")))
    }
}

/// Rejects non-success statuses. Auth failures are not retryable; anything
/// else is treated as the server being unavailable.
fn check_status(response: Response, operation: &str) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::AuthFailed(format!("{operation} returned HTTP {status}")));
    }
    Err(SyncError::Unreachable(format!("{operation} returned HTTP {status}")))
}

#[async_trait]
impl StorageBackend for HttpStorageBackend {
    async fn info_collections(&self) -> SyncResult<CollectionIndex> {
        let operation = "GET info/collections";
        let url = format!("{}/info/collections", self.root);
        let response = check_status(self.send(self.client.get(&url), operation).await?, operation)?;
        let body = Self::body(response, operation).await?;

        serde_json::from_str(&body)
            .map_err(|e| SyncError::Malformed(format!("info/collections: {e}")))
    }

    async fn get_record(&self, collection: &str, id: &str) -> SyncResult<Option<RemoteRecord>> {
        let operation = "GET record";
        let url = self.record_url(collection, id);
        let response = self.send(self.client.get(&url), operation).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{collection}/{id} not found on server");
            return Ok(None);
        }
        let body = Self::body(check_status(response, operation)?, operation).await?;

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| SyncError::Malformed(format!("{collection}/{id}: {e}")))
    }

    async fn put_record(&self, collection: &str, record: RemoteRecord) -> SyncResult<f64> {
        let operation = "PUT record";
        let url = self.record_url(collection, &record.id);
        let response = self.send(self.client.put(&url).json(&record), operation).await?;
        let body = Self::body(check_status(response, operation)?, operation).await?;

        body.trim().parse::<f64>().map_err(|e| {
            SyncError::Malformed(format!("{collection}/{}: bad timestamp {body:?}: {e}", record.id))
        })
    }

    async fn delete_all(&self) -> SyncResult<()> {
        let operation = "DELETE storage";
        let url = format!("{}/storage", self.root);
        let response = self.send(self.client.delete(&url), operation).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, operation)?;
        Ok(())
    }
}
