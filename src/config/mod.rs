
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::imaging::DEFAULT_MAX_DIM;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// Maximum accepted request body in bytes (multipart uploads)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Longest side of a prepared image, in pixels
    #[serde(default = "default_max_dim")]
    pub max_dim: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// API key for the OpenAI-compatible provider. Supports `${VAR}` expansion.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_inference_timeout")]
    pub timeout_seconds: u64,

    /// Instruction sent for captioning requests
    #[serde(default = "default_caption_prompt")]
    pub caption_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// imgbb API key. Empty disables the external host and every image is kept locally.
    #[serde(default)]
    pub imgbb_api_key: String,

    #[serde(default = "default_imgbb_upload_url")]
    pub imgbb_upload_url: String,

    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_seconds: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,

    /// User agent sent when fetching external image URLs
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Parent directory for the per-process temp store (default: system temp dir)
    #[serde(default)]
    pub temp_dir: Option<String>,

    /// Local entries older than this are swept (0 = keep until shutdown)
    #[serde(default = "default_entry_ttl")]
    pub entry_ttl_seconds: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the backend used by the terminal front end
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    #[serde(default = "default_save_timeout")]
    pub save_timeout_seconds: u64,

    #[serde(default = "default_answer_timeout")]
    pub answer_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Enable the /transcribe endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Backend: "openai" or "local" (default: "openai")
    #[serde(default = "default_audio_backend")]
    pub backend: String,

    /// Command template for the local backend, e.g. "whisper-cli -nt -f {}".
    /// `{}` is replaced with the audio file path.
    #[serde(default)]
    pub local_command: Option<String>,

    #[serde(default = "default_openai_audio_model")]
    pub openai_model: String,

    #[serde(default = "default_audio_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Command template used for camera capture, e.g. "fswebcam --no-banner {}".
    /// `{}` is replaced with the output image path.
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_port() -> u16 {
    8000
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}
fn default_max_dim() -> u32 {
    DEFAULT_MAX_DIM
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    250
}
fn default_inference_timeout() -> u64 {
    60
}
fn default_caption_prompt() -> String {
    "Provide a short descriptive caption for this image.".to_string()
}
fn default_imgbb_upload_url() -> String {
    "https://api.imgbb.com/1/upload".to_string()
}
fn default_upload_timeout() -> u64 {
    20
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}
fn default_entry_ttl() -> u64 {
    24 * 60 * 60
}
fn default_sweep_interval() -> u64 {
    10 * 60
}
fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_save_timeout() -> u64 {
    30
}
fn default_answer_timeout() -> u64 {
    60
}
fn default_audio_backend() -> String {
    "openai".to_string()
}
fn default_openai_audio_model() -> String {
    "whisper-1".to_string()
}
fn default_audio_timeout_seconds() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_dim: default_max_dim(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_inference_timeout(),
            caption_prompt: default_caption_prompt(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            imgbb_api_key: String::new(),
            imgbb_upload_url: default_imgbb_upload_url(),
            upload_timeout_seconds: default_upload_timeout(),
            fetch_timeout_seconds: default_fetch_timeout(),
            user_agent: default_user_agent(),
            temp_dir: None,
            entry_ttl_seconds: default_entry_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            save_timeout_seconds: default_save_timeout(),
            answer_timeout_seconds: default_answer_timeout(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_audio_backend(),
            local_command: None,
            openai_model: default_openai_audio_model(),
            timeout_seconds: default_audio_timeout_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Listen address; `bind` may be IPv4 or IPv6.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .trim()
            .parse()
            .with_context(|| format!("server.bind is not an IP address: {:?}", self.bind))?;
        Ok(SocketAddr::from((ip, self.port)))
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl StorageConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        (self.entry_ttl_seconds > 0).then(|| Duration::from_secs(self.entry_ttl_seconds))
    }

    pub fn temp_parent(&self) -> PathBuf {
        match self.temp_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => PathBuf::from(shellexpand::tilde(dir).to_string()),
            _ => std::env::temp_dir(),
        }
    }
}

impl Config {
    /// Load from the default location, creating a commented template on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            Self::write_template(path)?;
            Config::default()
        };

        config.expand_env_vars();
        config.apply_env_overrides();

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Resolve `--config`/`PIXELSENSE_CONFIG` or fall back to the default path.
    pub fn load_with_override(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(&PathBuf::from(shellexpand::tilde(p).to_string())),
            None => Self::load(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }

        if self.image.max_dim == 0 {
            anyhow::bail!("image.max_dim must be greater than zero");
        }

        if self.inference.max_tokens == 0 {
            anyhow::bail!("inference.max_tokens must be greater than zero");
        }

        for (key, seconds) in [
            ("inference.timeout_seconds", self.inference.timeout_seconds),
            ("storage.upload_timeout_seconds", self.storage.upload_timeout_seconds),
            ("storage.fetch_timeout_seconds", self.storage.fetch_timeout_seconds),
            ("client.save_timeout_seconds", self.client.save_timeout_seconds),
            ("client.answer_timeout_seconds", self.client.answer_timeout_seconds),
            ("audio.timeout_seconds", self.audio.timeout_seconds),
        ] {
            if seconds == 0 {
                anyhow::bail!("{} must be greater than zero", key);
            }
        }

        for (key, url) in [
            ("inference.base_url", &self.inference.base_url),
            ("storage.imgbb_upload_url", &self.storage.imgbb_upload_url),
            ("client.backend_url", &self.client.backend_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{} must be an http(s) URL (got {:?})", key, url);
            }
        }

        if self.audio.enabled {
            match self.audio.backend.as_str() {
                "openai" => {}
                "local" => {
                    if self.audio.local_command.is_none() {
                        anyhow::bail!("audio.backend 'local' requires audio.local_command");
                    }
                }
                other => anyhow::bail!("Unknown audio backend: {}", other),
            }
        }

        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

        Ok(base.home_dir().join(".pixelsense").join("config.toml"))
    }

    fn expand_env_vars(&mut self) {
        self.inference.api_key = expand_env(&self.inference.api_key);
        self.storage.imgbb_api_key = expand_env(&self.storage.imgbb_api_key);
    }

    /// Environment variables win over the file so a `.env`-style deployment works unchanged.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.inference.api_key = v;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.inference.base_url = v;
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.inference.model = v;
        }
        if let Some(v) = get("IMGBB_API_KEY") {
            self.storage.imgbb_api_key = v;
        }
        if let Some(v) = get("BACKEND_URL") {
            self.client.backend_url = v;
        }
        if let Some(v) = get("MAX_IMAGE_DIM") {
            match v.trim().parse::<u32>() {
                Ok(dim) => self.image.max_dim = dim,
                Err(_) => tracing::warn!("Ignoring invalid MAX_IMAGE_DIM: {}", v),
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["server", "port"] => Ok(self.server.port.to_string()),
            ["server", "bind"] => Ok(self.server.bind.clone()),
            ["image", "max_dim"] => Ok(self.image.max_dim.to_string()),
            ["inference", "base_url"] => Ok(self.inference.base_url.clone()),
            ["inference", "model"] => Ok(self.inference.model.clone()),
            ["inference", "max_tokens"] => Ok(self.inference.max_tokens.to_string()),
            ["inference", "caption_prompt"] => Ok(self.inference.caption_prompt.clone()),
            ["storage", "imgbb_upload_url"] => Ok(self.storage.imgbb_upload_url.clone()),
            ["storage", "entry_ttl_seconds"] => Ok(self.storage.entry_ttl_seconds.to_string()),
            ["client", "backend_url"] => Ok(self.client.backend_url.clone()),
            ["audio", "enabled"] => Ok(self.audio.enabled.to_string()),
            ["audio", "backend"] => Ok(self.audio.backend.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["server", "port"] => self.server.port = value.parse()?,
            ["server", "bind"] => self.server.bind = value.to_string(),
            ["image", "max_dim"] => self.image.max_dim = value.parse()?,
            ["inference", "base_url"] => self.inference.base_url = value.to_string(),
            ["inference", "model"] => self.inference.model = value.to_string(),
            ["inference", "max_tokens"] => self.inference.max_tokens = value.parse()?,
            ["inference", "caption_prompt"] => self.inference.caption_prompt = value.to_string(),
            ["storage", "imgbb_upload_url"] => self.storage.imgbb_upload_url = value.to_string(),
            ["storage", "entry_ttl_seconds"] => self.storage.entry_ttl_seconds = value.parse()?,
            ["client", "backend_url"] => self.client.backend_url = value.to_string(),
            ["audio", "enabled"] => self.audio.enabled = value.parse()?,
            ["audio", "backend"] => self.audio.backend = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

/// Expand `${VAR}` or `$VAR`. An unset variable expands to an empty string so
/// the template's placeholders never end up sent as credentials.
fn expand_env(s: &str) -> String {
    let var_name = s
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .or_else(|| s.strip_prefix('$'));

    match var_name {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => s.to_string(),
    }
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# PixelSense Configuration
# Auto-created on first run. Edit as needed.
# Environment variables override these values:
#   OPENAI_API_KEY, OPENAI_BASE_URL, OPENAI_MODEL, IMGBB_API_KEY, BACKEND_URL, MAX_IMAGE_DIM

[server]
port = 8000
bind = "127.0.0.1"

[image]
# Longest side of a prepared image, in pixels
max_dim = 1024

[inference]
api_key = "${OPENAI_API_KEY}"
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
max_tokens = 250
timeout_seconds = 60
caption_prompt = "Provide a short descriptive caption for this image."

[storage]
# Leave empty to keep every image in the local temp store
imgbb_api_key = "${IMGBB_API_KEY}"
upload_timeout_seconds = 20
fetch_timeout_seconds = 20
# Local temp entries older than this are deleted (0 = keep until shutdown)
entry_ttl_seconds = 86400
sweep_interval_seconds = 600

[client]
backend_url = "http://127.0.0.1:8000"

# Speech-to-text for spoken questions
# [audio]
# enabled = true
# backend = "openai"              # or "local"
# local_command = "whisper-cli -nt -f {}"

# Camera capture for the terminal front end
# [capture]
# command = "fswebcam --no-banner {}"

[logging]
level = "info"
"#;
