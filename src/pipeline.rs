//! In-process image pipeline shared by the HTTP server and the local front end.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::imaging::{prepare_image_async, PreparedImage};
use crate::inference::{Answer, InferenceClient, Query};
use crate::server::audio::{create_transcriber, AudioTranscriber};
use crate::storage::{ImageStore, StoredReference};

pub struct Pipeline {
    store: Arc<ImageStore>,
    inference: InferenceClient,
    transcriber: Option<Arc<dyn AudioTranscriber>>,
}

impl Pipeline {
    pub fn new(
        store: Arc<ImageStore>,
        inference: InferenceClient,
        transcriber: Option<Arc<dyn AudioTranscriber>>,
    ) -> Self {
        Self {
            store,
            inference,
            transcriber,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = ImageStore::from_config(config).context("Failed to set up image store")?;
        let inference =
            InferenceClient::new(&config.inference).context("Failed to build inference client")?;
        let transcriber = create_transcriber(config)?;
        Ok(Self::new(Arc::new(store), inference, transcriber))
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    pub fn inference(&self) -> &InferenceClient {
        &self.inference
    }

    pub fn transcriber(&self) -> Option<&Arc<dyn AudioTranscriber>> {
        self.transcriber.as_ref()
    }

    /// Answer a query about freshly uploaded bytes.
    pub async fn answer_bytes(&self, bytes: Vec<u8>, query: &Query) -> Answer {
        match prepare_image_async(bytes, self.store.max_dim()).await {
            Ok(prepared) => self.answer_prepared(&prepared, None, query).await,
            Err(e) => {
                warn!("Rejected {} upload: {}", query.kind(), e);
                Answer::Failed(format!("Could not read image: {}", e))
            }
        }
    }

    /// Answer a query about an image that was stored earlier.
    pub async fn answer_reference(&self, reference: &StoredReference, query: &Query) -> Answer {
        match self.store.retrieve(reference).await {
            Ok(prepared) => self.answer_prepared(&prepared, Some(reference), query).await,
            Err(e) => {
                warn!("Could not resolve {}: {}", reference.location, e);
                Answer::Failed(format!(
                    "Could not fetch image from URL or local file: {}",
                    e
                ))
            }
        }
    }

    async fn answer_prepared(
        &self,
        prepared: &PreparedImage,
        existing: Option<&StoredReference>,
        query: &Query,
    ) -> Answer {
        let image_url = self.model_url(prepared, existing).await;
        self.inference.answer(&image_url, query).await
    }

    /// A URL the hosted model can open. External references are used as-is;
    /// anything else is published to an external host, or sent inline as a
    /// `data:` URL. Answering never adds files to the local store.
    async fn model_url(&self, prepared: &PreparedImage, existing: Option<&StoredReference>) -> String {
        if let Some(reference) = existing.filter(|r| !r.is_local()) {
            return reference.location.clone();
        }
        if !self.store.has_external() {
            debug!("No external image host, sending image inline");
            return prepared.data_url();
        }

        match self.store.publish_external(&prepared.bytes, "query.png").await {
            Ok(reference) => reference.location,
            Err(e) => {
                warn!("Could not publish query image, sending inline: {}", e);
                prepared.data_url()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::imaging::tests::jpeg_bytes;
    use crate::storage::LocalBackend;

    fn pipeline(dir: &tempfile::TempDir) -> Pipeline {
        let local = Arc::new(LocalBackend::create(dir.path()).unwrap());
        let store = Arc::new(ImageStore::new(vec![], local, 1024));
        // no API key: every inference call fails fast
        let inference = InferenceClient::new(&InferenceConfig::default()).unwrap();
        Pipeline::new(store, inference, None)
    }

    #[tokio::test]
    async fn test_missing_reference_is_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let answer = pipeline(&dir)
            .answer_reference(&StoredReference::parse("/files/missing.png"), &Query::Caption)
            .await;
        assert!(answer
            .to_string()
            .starts_with("❌ Error: Could not fetch image from URL or local file"));
    }

    #[tokio::test]
    async fn test_garbage_upload_is_failed_answer() {
        let dir = tempfile::tempdir().unwrap();
        let answer = pipeline(&dir)
            .answer_bytes(b"garbage".to_vec(), &Query::Caption)
            .await;
        assert!(answer.to_string().starts_with("❌ Error: Could not read image"));
    }

    #[tokio::test]
    async fn test_local_only_store_inlines_image() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let prepared = crate::imaging::prepare_image(&jpeg_bytes(40, 20), 1024).unwrap();
        let reference = pipeline.store().store_local(&prepared.bytes).await.unwrap();

        let url = pipeline.model_url(&prepared, Some(&reference)).await;
        assert!(url.starts_with("data:image/png;base64,"));
        // nothing new was written for an already stored local image
        assert_eq!(pipeline.store().local().entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_answering_uploaded_bytes_leaves_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);

        for query in [Query::Caption, Query::vqa("what colour?")] {
            pipeline.answer_bytes(jpeg_bytes(80, 60), &query).await;
        }
        assert_eq!(pipeline.store().local().entry_count().await.unwrap(), 0);
    }
}
