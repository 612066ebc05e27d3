//! Session flow controller
//!
//! [`SessionContext`] walks one image through
//! `NoInput → InputChosen → ImageCaptured → ImageSaved → AnswerReady`.
//! The image, its stored reference and the last answer live and die
//! together: [`SessionContext::reset`] is the only way back to `NoInput`.
//! Backend work goes through the [`ImageService`] seam so the same controller
//! drives a remote backend or the in-process pipeline.

pub mod backend;
pub mod capture;

pub use backend::HttpBackend;
pub use capture::capture_with_command;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::imaging::{inspect, prepare_image, ImageAsset, ImageError, PreparedImage};
use crate::inference::{Answer, Query};
use crate::storage::StoredReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoInput,
    InputChosen,
    ImageCaptured,
    ImageSaved,
    AnswerReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMethod {
    Upload,
    Capture,
}

impl InputMethod {
    fn filename(&self) -> &'static str {
        match self {
            InputMethod::Upload => "upload.png",
            InputMethod::Capture => "capture.png",
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Choose an input method first")]
    NoInputMethod,

    #[error("No image yet. Upload or capture one first")]
    NoImage,

    #[error("An image is already saved. Reset to start over")]
    ResetRequired,

    #[error("Please save the image first")]
    NotSaved,

    #[error("Please enter a question")]
    EmptyQuestion,

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// What the controller needs from a backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Persist prepared PNG bytes and return where they ended up.
    async fn store(&self, png: &[u8], filename: &str) -> anyhow::Result<StoredReference>;

    /// Ask the model about a stored image. Failures come back as [`Answer::Failed`].
    async fn answer(&self, reference: &StoredReference, query: &Query) -> Answer;

    /// Delete a stored image. Only local entries are actually removed.
    async fn discard(&self, reference: &StoredReference) -> anyhow::Result<()>;

    async fn transcribe(&self, audio: &[u8], filename: &str) -> anyhow::Result<String>;
}

pub struct SessionContext {
    state: SessionState,
    method: Option<InputMethod>,
    asset: Option<ImageAsset>,
    prepared: Option<PreparedImage>,
    reference: Option<StoredReference>,
    query: Option<Query>,
    answer: Option<Answer>,
    max_dim: u32,
}

impl SessionContext {
    pub fn new(max_dim: u32) -> Self {
        Self {
            state: SessionState::NoInput,
            method: None,
            asset: None,
            prepared: None,
            reference: None,
            query: None,
            answer: None,
            max_dim,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn input_method(&self) -> Option<InputMethod> {
        self.method
    }

    /// The image as it was handed in.
    pub fn asset(&self) -> Option<&ImageAsset> {
        self.asset.as_ref()
    }

    /// The prepared image that will be saved.
    pub fn preview(&self) -> Option<&PreparedImage> {
        self.prepared.as_ref()
    }

    pub fn reference(&self) -> Option<&StoredReference> {
        self.reference.as_ref()
    }

    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    pub fn answer(&self) -> Option<&Answer> {
        self.answer.as_ref()
    }

    fn is_saved(&self) -> bool {
        self.reference.is_some()
    }

    pub fn choose_input(&mut self, method: InputMethod) -> Result<(), SessionError> {
        if self.is_saved() {
            return Err(SessionError::ResetRequired);
        }
        self.method = Some(method);
        if self.state == SessionState::NoInput {
            self.state = SessionState::InputChosen;
        }
        debug!("Input method set to {:?}", method);
        Ok(())
    }

    /// Take new image bytes and prepare them right away. A second capture
    /// before saving replaces the first.
    pub fn capture(&mut self, bytes: Vec<u8>) -> Result<&PreparedImage, SessionError> {
        match self.state {
            SessionState::NoInput => return Err(SessionError::NoInputMethod),
            SessionState::ImageSaved | SessionState::AnswerReady => {
                return Err(SessionError::ResetRequired)
            }
            SessionState::InputChosen | SessionState::ImageCaptured => {}
        }

        let asset = inspect(&bytes)?;
        let prepared = prepare_image(&asset.bytes, self.max_dim)?;
        debug!(
            "Captured {}x{} {}, prepared {}x{}",
            asset.width,
            asset.height,
            asset.media_type(),
            prepared.width,
            prepared.height
        );

        self.asset = Some(asset);
        self.state = SessionState::ImageCaptured;
        Ok(self.prepared.insert(prepared))
    }

    /// Persist the prepared image. On failure the state does not move.
    pub async fn save(
        &mut self,
        service: &dyn ImageService,
    ) -> Result<&StoredReference, SessionError> {
        match self.state {
            SessionState::NoInput => return Err(SessionError::NoInputMethod),
            SessionState::InputChosen => return Err(SessionError::NoImage),
            _ => {}
        }
        if self.reference.is_some() {
            return Err(SessionError::ResetRequired);
        }
        let prepared = self.prepared.as_ref().ok_or(SessionError::NoImage)?;
        let filename = self.method.unwrap_or(InputMethod::Upload).filename();

        let reference = service
            .store(&prepared.bytes, filename)
            .await
            .map_err(|e| SessionError::Backend(format!("{:#}", e)))?;

        info!("Saved image as {}", reference.location);
        self.state = SessionState::ImageSaved;
        Ok(self.reference.insert(reference))
    }

    /// Ask about the saved image. The answer replaces any previous one.
    pub async fn get_answer(
        &mut self,
        service: &dyn ImageService,
        query: Query,
    ) -> Result<&Answer, SessionError> {
        let reference = self.reference.as_ref().ok_or(SessionError::NotSaved)?;
        if let Query::Vqa { question } = &query {
            if question.trim().is_empty() {
                return Err(SessionError::EmptyQuestion);
            }
        }

        let answer = service.answer(reference, &query).await;
        self.state = if answer.is_ok() {
            SessionState::AnswerReady
        } else {
            SessionState::ImageSaved
        };
        self.query = Some(query);
        Ok(self.answer.insert(answer))
    }

    pub async fn transcribe(
        &self,
        service: &dyn ImageService,
        audio: &[u8],
        filename: &str,
    ) -> Result<String, SessionError> {
        service
            .transcribe(audio, filename)
            .await
            .map(|text| text.trim().to_string())
            .map_err(|e| SessionError::Backend(format!("{:#}", e)))
    }

    /// Drop everything and go back to `NoInput`. The stored local file is
    /// deleted on a best-effort basis.
    pub async fn reset(&mut self, service: &dyn ImageService) {
        if let Some(reference) = self.reference.take() {
            if reference.is_local() {
                if let Err(e) = service.discard(&reference).await {
                    warn!("Failed to delete {}: {:#}", reference.location, e);
                }
            }
        }
        *self = Self::new(self.max_dim);
    }
}
