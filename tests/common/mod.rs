#![allow(dead_code)]

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use pixelsense::config::Config;
use pixelsense::pipeline::Pipeline;
use pixelsense::server::Server;

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 200])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    out
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("http://{}", addr))
}

/// Stand-in for the chat-completion API. Records every request body.
#[derive(Clone, Default)]
pub struct FakeModel {
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeModel {
    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_image_url(&self) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests.last().and_then(|body| {
            body["messages"][0]["content"][1]["image_url"]["url"]
                .as_str()
                .map(str::to_string)
        })
    }
}

async fn chat_completions(State(model): State<FakeModel>, Json(body): Json<Value>) -> Json<Value> {
    let prompt = body["messages"][0]["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    model.requests.lock().unwrap().push(body);
    Json(json!({
        "choices": [{"message": {"role": "assistant", "content": format!("Answer to: {}", prompt)}}]
    }))
}

/// Returns the `/v1` base URL.
pub async fn spawn_fake_model() -> (String, FakeModel) {
    let model = FakeModel::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(model.clone());
    let (listener, base) = bind().await;
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("{}/v1", base), model)
}

/// Stand-in for imgbb: accepts uploads and serves them back.
pub async fn spawn_fake_imgbb() -> String {
    let (listener, base) = bind().await;
    let hosted = format!("{}/i/hosted.png", base);
    let png = {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(16, 8))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    };

    let app = Router::new()
        .route(
            "/1/upload",
            post(move || {
                let hosted = hosted.clone();
                async move { Json(json!({"data": {"url": hosted}, "success": true})) }
            }),
        )
        .route(
            "/i/hosted.png",
            get(move || {
                let png = png.clone();
                async move { png }
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("{}/1/upload", base)
}

pub struct TestApp {
    pub base: String,
    pub pipeline: Arc<Pipeline>,
    pub model: FakeModel,
    pub client: reqwest::Client,
    _temp: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn stored_files(&self) -> usize {
        self.pipeline.store().local().entry_count().await.unwrap()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn test_config(temp: &TempDir, model_base: &str) -> Config {
    let mut config = Config::default();
    config.inference.api_key = "sk-test".to_string();
    config.inference.base_url = model_base.to_string();
    config.inference.timeout_seconds = 5;
    config.storage.temp_dir = Some(temp.path().to_string_lossy().to_string());
    config.storage.upload_timeout_seconds = 2;
    config.storage.fetch_timeout_seconds = 2;
    config
}

/// Start the real router on an ephemeral port. `tweak` adjusts the config.
pub async fn spawn_app(tweak: impl FnOnce(&mut Config)) -> TestApp {
    let (model_base, model) = spawn_fake_model().await;
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp, &model_base);
    tweak(&mut config);

    let server = Server::new(&config).unwrap();
    let pipeline = server.pipeline().clone();
    let (listener, base) = bind().await;
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = rx.await;
        };
        let _: anyhow::Result<()> = server.serve(listener, shutdown).await;
    });

    TestApp {
        base,
        pipeline,
        model,
        client: reqwest::Client::new(),
        _temp: temp,
        shutdown: Some(tx),
    }
}

pub fn image_part(bytes: Vec<u8>, name: &str) -> reqwest::multipart::Part {
    reqwest::multipart::Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str("image/jpeg")
        .unwrap()
}
