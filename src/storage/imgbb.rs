use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::debug;

use super::{BackendKind, FetchError, StorageBackend, StoreError, StoredReference};
use crate::config::StorageConfig;

/// External image host (imgbb). Stores by uploading base64 form data and
/// resolves any http(s) reference with a plain GET.
pub struct ImgbbBackend {
    api_key: String,
    upload_url: String,
    upload_client: reqwest::Client,
    fetch_client: reqwest::Client,
}

#[derive(Deserialize)]
struct UploadResponse {
    data: UploadData,
}

#[derive(Deserialize)]
struct UploadData {
    url: String,
}

impl ImgbbBackend {
    pub fn new(config: &StorageConfig) -> Result<Self, reqwest::Error> {
        let upload_client = reqwest::Client::builder()
            .timeout(config.upload_timeout())
            .build()?;
        let fetch_client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            api_key: config.imgbb_api_key.trim().to_string(),
            upload_url: config.imgbb_upload_url.clone(),
            upload_client,
            fetch_client,
        })
    }
}

#[async_trait]
impl StorageBackend for ImgbbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn name(&self) -> &'static str {
        "imgbb"
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn store(
        &self,
        bytes: &[u8],
        filename_hint: &str,
    ) -> Result<StoredReference, StoreError> {
        if !self.is_configured() {
            return Err(StoreError::NotConfigured("imgbb API key"));
        }

        let encoded = STANDARD.encode(bytes);
        let form = [("key", self.api_key.as_str()), ("image", encoded.as_str())];

        debug!("Uploading {} ({} bytes) to imgbb", filename_hint, bytes.len());
        let response = self
            .upload_client
            .post(&self.upload_url)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| StoreError::MalformedResponse(e.to_string()))?;

        Ok(StoredReference::new(parsed.data.url, BackendKind::External))
    }

    async fn fetch(&self, reference: &StoredReference) -> Result<Vec<u8>, FetchError> {
        let response = self.fetch_client.get(&reference.location).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: reference.location.clone(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let backend = ImgbbBackend::new(&StorageConfig::default()).unwrap();
        assert!(!backend.is_configured());

        let err = backend.store(b"png", "x.png").await.unwrap_err();
        assert!(matches!(err, StoreError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_soft_failure() {
        let config = StorageConfig {
            imgbb_api_key: "key".to_string(),
            // nothing listens on the discard port
            imgbb_upload_url: "http://127.0.0.1:9/upload".to_string(),
            upload_timeout_seconds: 2,
            ..StorageConfig::default()
        };
        let backend = ImgbbBackend::new(&config).unwrap();

        let err = backend.store(b"png", "x.png").await.unwrap_err();
        assert!(matches!(err, StoreError::Request(_)), "{}", err);
    }
}
