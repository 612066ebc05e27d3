//! HTTP server for PixelSense
//!
//! Stateless image endpoints in front of the shared [`Pipeline`]. Requests
//! never share anything but the local temp store, which is swept on a timer
//! and purged on shutdown.

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::imaging::{prepare_image_async, PNG_MEDIA_TYPE};
use crate::inference::{Answer, Query};
use crate::pipeline::Pipeline;
use crate::storage::{FetchError, StoredReference};

pub struct Server {
    config: Config,
    pipeline: Arc<Pipeline>,
}

struct AppState {
    config: Config,
    pipeline: Arc<Pipeline>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl AnswerResponse {
    fn new(answer: &Answer, query: &Query) -> Self {
        let question = match query {
            Query::Caption => None,
            Query::Vqa { question } => Some(question.clone()),
        };
        Self {
            answer: answer.to_string(),
            question,
            kind: query.kind().to_string(),
            status: Some(answer.status().to_string()),
        }
    }

    pub fn into_answer(self) -> Answer {
        Answer::from_wire(self.status.as_deref(), self.answer)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub model: String,
    pub max_image_dim: u32,
    pub external_store: bool,
    pub stored_files: usize,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let pipeline = Arc::new(Pipeline::from_config(config)?);
        Ok(Self::with_pipeline(config, pipeline))
    }

    pub fn with_pipeline(config: &Config, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config: config.clone(),
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            pipeline: self.pipeline.clone(),
        });

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health_check))
            .route("/api/status", get(status))
            .route("/upload-image", post(upload_image))
            .route("/image-caption", post(image_caption))
            .route("/image-vqa", post(image_vqa))
            .route("/files/{name}", get(serve_file).delete(delete_file))
            .route("/transcribe", post(transcribe))
            .layer(DefaultBodyLimit::max(self.config.server.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state)
    }

    pub async fn run(&self) -> Result<()> {
        let addr = self.config.server.socket_addr()?;

        let listener = TcpListener::bind(addr).await?;
        info!("Starting HTTP server on http://{}", addr);

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then
    /// empty the local store.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let storage = &self.config.storage;
        if let Some(ttl) = storage.entry_ttl() {
            if storage.sweep_interval_seconds > 0 {
                self.pipeline.store().local().spawn_sweeper(
                    Duration::from_secs(storage.sweep_interval_seconds),
                    ttl,
                );
            }
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        match self.pipeline.store().local().purge().await {
            Ok(n) => info!("Removed {} local images on shutdown", n),
            Err(e) => warn!("Failed to clean local image store: {}", e),
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// Error response type
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "detail": self.1 }))).into_response()
    }
}

impl From<FetchError> for AppError {
    fn from(e: FetchError) -> Self {
        let status = match e {
            FetchError::NotFound(_) => StatusCode::NOT_FOUND,
            FetchError::InvalidName(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError(status, e.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError(StatusCode::BAD_REQUEST, message.into())
}

/// Fields shared by the image endpoints. Accepts multipart or urlencoded bodies.
#[derive(Debug, Default)]
struct ImageForm {
    file: Option<Vec<u8>>,
    file_name: Option<String>,
    file_url: Option<String>,
    question: Option<String>,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl ImageForm {
    async fn from_multipart(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let file_name = field.file_name().map(str::to_string);
                    let data = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
                    // browsers send an empty part when nothing was picked
                    if !data.is_empty() {
                        form.file = Some(data.to_vec());
                        form.file_name = file_name;
                    }
                }
                "file_url" | "question" => {
                    let value = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                    if name == "file_url" {
                        form.file_url = non_empty(value);
                    } else {
                        form.question = non_empty(value);
                    }
                }
                other => debug!("Ignoring form field {}", other),
            }
        }
        Ok(form)
    }

    fn from_fields(mut fields: HashMap<String, String>) -> Self {
        Self {
            file: None,
            file_name: None,
            file_url: fields.remove("file_url").and_then(non_empty),
            question: fields.remove("question").and_then(non_empty),
        }
    }
}

impl<S> FromRequest<S> for ImageForm
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| bad_request(e.body_text()))?;
            Self::from_multipart(multipart).await
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| bad_request(e.body_text()))?;
            Ok(Self::from_fields(fields))
        } else {
            Ok(Self::default())
        }
    }
}

// Health check
async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let store = state.pipeline.store();
    let stored_files = store.local().entry_count().await.unwrap_or(0);

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.inference.model.clone(),
        max_image_dim: store.max_dim(),
        external_store: store.has_external(),
        stored_files,
    })
}

async fn upload_image(
    State(state): State<Arc<AppState>>,
    form: ImageForm,
) -> Result<Json<UploadResponse>, AppError> {
    let bytes = form.file.ok_or_else(|| bad_request("Missing file field"))?;
    let store = state.pipeline.store();

    let prepared = prepare_image_async(bytes, store.max_dim())
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    let reference = store
        .store_local(&prepared.bytes)
        .await
        .map_err(|e| AppError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    debug!(
        "Upload {} stored as {}",
        form.file_name.as_deref().unwrap_or("<unnamed>"),
        reference.location
    );

    Ok(Json(UploadResponse {
        message: "✅ Image uploaded successfully".to_string(),
        url: reference.location,
    }))
}

async fn answer_form(state: &AppState, form: ImageForm, query: &Query) -> Answer {
    if let Some(bytes) = form.file {
        return state.pipeline.answer_bytes(bytes, query).await;
    }
    if let Some(url) = form.file_url {
        return state
            .pipeline
            .answer_reference(&StoredReference::parse(&url), query)
            .await;
    }
    Answer::Failed("No image provided".to_string())
}

async fn image_caption(
    State(state): State<Arc<AppState>>,
    form: ImageForm,
) -> Json<AnswerResponse> {
    let query = Query::Caption;
    let answer = answer_form(&state, form, &query).await;
    Json(AnswerResponse::new(&answer, &query))
}

async fn image_vqa(
    State(state): State<Arc<AppState>>,
    form: ImageForm,
) -> Result<Json<AnswerResponse>, AppError> {
    // checked before touching the image
    let question = form
        .question
        .clone()
        .ok_or_else(|| AppError(StatusCode::BAD_REQUEST, "Missing required field: question".into()))?;

    let query = Query::vqa(question);
    let answer = answer_form(&state, form, &query).await;
    Ok(Json(AnswerResponse::new(&answer, &query)))
}

async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let bytes = state.pipeline.store().local().read(&name).await?;
    Ok(([(header::CONTENT_TYPE, PNG_MEDIA_TYPE)], bytes).into_response())
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.pipeline.store().local().delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn transcribe(
    State(state): State<Arc<AppState>>,
    form: ImageForm,
) -> Result<Json<TranscriptionResponse>, AppError> {
    let transcriber = state.pipeline.transcriber().ok_or_else(|| {
        AppError(
            StatusCode::SERVICE_UNAVAILABLE,
            "Audio transcription is disabled".to_string(),
        )
    })?;
    let audio = form.file.ok_or_else(|| bad_request("Missing file field"))?;
    let filename = form.file_name.unwrap_or_else(|| "audio.wav".to_string());

    let text = transcriber
        .transcribe(&audio, &filename)
        .await
        .map_err(|e| AppError(StatusCode::BAD_GATEWAY, format!("{:#}", e)))?;

    Ok(Json(TranscriptionResponse {
        text: text.trim().to_string(),
    }))
}
