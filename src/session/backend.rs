//! [`ImageService`] implementations: the HTTP backend client and the
//! in-process [`Pipeline`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

use super::ImageService;
use crate::config::ClientConfig;
use crate::imaging::PNG_MEDIA_TYPE;
use crate::inference::{Answer, Query};
use crate::pipeline::Pipeline;
use crate::server::{AnswerResponse, StatusResponse, TranscriptionResponse, UploadResponse};
use crate::storage::StoredReference;

/// Talks to a running `pixelsense serve`.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    save_timeout: Duration,
    answer_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            save_timeout: Duration::from_secs(config.save_timeout_seconds),
            answer_timeout: Duration::from_secs(config.answer_timeout_seconds),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let response = self
            .client
            .get(self.url("/api/status"))
            .timeout(self.save_timeout)
            .send()
            .await
            .with_context(|| format!("Backend at {} is not reachable", self.base_url))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn request_answer(&self, reference: &StoredReference, query: &Query) -> Result<Answer> {
        let (path, fields) = match query {
            Query::Caption => ("/image-caption", vec![("file_url", reference.location.as_str())]),
            Query::Vqa { question } => (
                "/image-vqa",
                vec![
                    ("file_url", reference.location.as_str()),
                    ("question", question.as_str()),
                ],
            ),
        };

        let response = self
            .client
            .post(self.url(path))
            .timeout(self.answer_timeout)
            .form(&fields)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Backend returned {}: {}", status, body);
        }

        let parsed: AnswerResponse = response.json().await?;
        Ok(parsed.into_answer())
    }
}

#[async_trait]
impl ImageService for HttpBackend {
    async fn store(&self, png: &[u8], filename: &str) -> Result<StoredReference> {
        let part = Part::bytes(png.to_vec())
            .file_name(filename.to_string())
            .mime_str(PNG_MEDIA_TYPE)?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.url("/upload-image"))
            .timeout(self.save_timeout)
            .multipart(form)
            .send()
            .await
            .context("Could not reach backend")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upload failed ({}): {}", status, body);
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .context("Malformed upload response")?;
        debug!("{}", parsed.message);
        Ok(StoredReference::parse(&parsed.url))
    }

    async fn answer(&self, reference: &StoredReference, query: &Query) -> Answer {
        match self.request_answer(reference, query).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("{} request failed: {:#}", query.kind(), e);
                Answer::Failed(format!("{:#}", e))
            }
        }
    }

    async fn discard(&self, reference: &StoredReference) -> Result<()> {
        let Some(name) = reference.local_name() else {
            return Ok(());
        };

        let response = self
            .client
            .delete(self.url(&format!("/files/{}", name)))
            .timeout(self.save_timeout)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("{} was already gone", reference.location);
                Ok(())
            }
            s => anyhow::bail!("Delete of {} failed: {}", reference.location, s),
        }
    }

    async fn transcribe(&self, audio: &[u8], filename: &str) -> Result<String> {
        let part = Part::bytes(audio.to_vec()).file_name(filename.to_string());
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.url("/transcribe"))
            .timeout(self.answer_timeout)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Transcription failed ({}): {}", status, body);
        }

        let parsed: TranscriptionResponse = response.json().await?;
        Ok(parsed.text)
    }
}

/// Runs everything in-process: no server needed.
#[async_trait]
impl ImageService for Pipeline {
    async fn store(&self, png: &[u8], filename: &str) -> Result<StoredReference> {
        Ok(self.store().store(png, filename).await?)
    }

    async fn answer(&self, reference: &StoredReference, query: &Query) -> Answer {
        self.answer_reference(reference, query).await
    }

    async fn discard(&self, reference: &StoredReference) -> Result<()> {
        Ok(self.store().discard(reference).await?)
    }

    async fn transcribe(&self, audio: &[u8], filename: &str) -> Result<String> {
        let transcriber = self
            .transcriber()
            .context("Audio transcription is disabled")?;
        transcriber.transcribe(audio, filename).await
    }
}
