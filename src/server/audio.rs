/// Speech-to-text for spoken questions.
///
/// Two backends behind one trait:
/// - Local command (e.g., whisper-cpp)
/// - OpenAI-compatible `/audio/transcriptions`
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::debug;

use crate::config::Config;

#[async_trait]
pub trait AudioTranscriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], filename: &str) -> Result<String>;
}

/// Local command transcriber using a shell command template.
/// The template should contain `{}` placeholder for the file path.
pub struct LocalCommandTranscriber {
    command_template: String,
}

impl LocalCommandTranscriber {
    pub fn new(command_template: String) -> Self {
        Self { command_template }
    }
}

#[async_trait]
impl AudioTranscriber for LocalCommandTranscriber {
    async fn transcribe(&self, audio: &[u8], filename: &str) -> Result<String> {
        let suffix = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("pixelsense-audio-")
            .suffix(&suffix)
            .tempfile()
            .context("Failed to create temp audio file")?;
        file.write_all(audio)?;
        file.flush()?;

        let path_str = file.path().to_str().context("Invalid audio file path")?;
        let command = self.command_template.replace("{}", path_str);
        debug!("Running transcription command: {}", command);

        let output = TokioCommand::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Local transcription command failed: {}", err);
        }
        let stdout = String::from_utf8(output.stdout)?;
        Ok(stdout)
    }
}

/// OpenAI Whisper transcriber.
pub struct OpenAITranscriber {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAITranscriber {
    pub fn new(api_key: String, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }
}

#[async_trait]
impl AudioTranscriber for OpenAITranscriber {
    async fn transcribe(&self, audio: &[u8], filename: &str) -> Result<String> {
        if self.api_key.is_empty() {
            anyhow::bail!("Transcription API key is not configured");
        }

        let part = reqwest::multipart::Part::bytes(audio.to_vec()).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("Transcription API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let text = json
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .context("No 'text' field in transcription response")?;
        Ok(text)
    }
}

/// Factory function to create a transcriber based on config.
pub fn create_transcriber(config: &Config) -> Result<Option<Arc<dyn AudioTranscriber>>> {
    if !config.audio.enabled {
        return Ok(None);
    }
    let backend = &config.audio.backend;
    match backend.as_str() {
        "local" => {
            let cmd = config
                .audio
                .local_command
                .as_ref()
                .context("Local backend selected but no command configured")?;
            Ok(Some(Arc::new(LocalCommandTranscriber::new(cmd.clone()))))
        }
        "openai" => Ok(Some(Arc::new(OpenAITranscriber::new(
            config.inference.api_key.clone(),
            &config.inference.base_url,
            &config.audio.openai_model,
            Duration::from_secs(config.audio.timeout_seconds),
        )?))),
        _ => anyhow::bail!("Unknown audio backend: {}", backend),
    }
}
