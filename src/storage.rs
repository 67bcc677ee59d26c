use crate::config::StorageConfig;
use crate::error::{AppError, AppResult};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Client for an S3-compatible HTTP object gateway.
///
/// Objects live at `{endpoint}/{bucket}/{key}`; authentication, when the
/// gateway wants it, is a bearer token. Only the three primitives the cache
/// backup needs are exposed.
pub struct ObjectStorageClient {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl ObjectStorageClient {
    pub fn new(config: &StorageConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .expect("reqwest client");
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Upload a local file under the given key
    pub async fn put(&self, key: &str, path: &Path) -> AppResult<()> {
        let bytes = tokio::fs::read(path).await?;
        debug!(key, size = bytes.len(), "Uploading object");
        let response = self
            .authorize(self.client.put(self.object_url(key)))
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Storage(format!(
                "PUT {key} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetch an object's bytes
    pub async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        let response = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Storage(format!(
                "GET {key} returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn exists(&self, key: &str) -> AppResult<bool> {
        let response = self
            .authorize(self.client.head(self.object_url(key)))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(AppError::Storage(format!("HEAD {key} returned {status}"))),
        }
    }

    /// Best-effort removal; missing objects are not an error
    pub async fn delete(&self, key: &str) -> AppResult<()> {
        let response = self
            .authorize(self.client.delete(self.object_url(key)))
            .send()
            .await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(AppError::Storage(format!(
                "DELETE {key} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_joins_cleanly() {
        let client = ObjectStorageClient::new(&StorageConfig {
            endpoint: "http://minio:9000/".to_string(),
            bucket: "cadence".to_string(),
            token: None,
            backup_batch: 8,
        });
        assert_eq!(
            client.object_url("abc123.mp3"),
            "http://minio:9000/cadence/abc123.mp3"
        );
    }
}
