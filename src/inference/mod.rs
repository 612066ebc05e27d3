//! Model inference proxy
//!
//! One chat-completion call per question against an OpenAI-compatible API.
//! [`InferenceClient::infer`] returns a typed error; [`InferenceClient::answer`]
//! folds every failure into [`Answer::Failed`] so callers always get something
//! to display.

pub mod error;

pub use error::InferenceError;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::InferenceConfig;

/// Prefix used when a failed answer is rendered as text.
pub const ERROR_PREFIX: &str = "❌ Error: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Query {
    Caption,
    Vqa { question: String },
}

impl Query {
    pub fn vqa(question: impl Into<String>) -> Self {
        Query::Vqa {
            question: question.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Query::Caption => "caption",
            Query::Vqa { .. } => "vqa",
        }
    }

    /// Text sent to the model alongside the image.
    pub fn prompt<'a>(&'a self, caption_prompt: &'a str) -> &'a str {
        match self {
            Query::Caption => caption_prompt,
            Query::Vqa { question } => question,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "text", rename_all = "lowercase")]
pub enum Answer {
    #[serde(rename = "ok")]
    Text(String),
    #[serde(rename = "error")]
    Failed(String),
}

impl Answer {
    pub fn is_ok(&self) -> bool {
        matches!(self, Answer::Text(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            Answer::Text(_) => "ok",
            Answer::Failed(_) => "error",
        }
    }

    /// Rebuild an answer from its wire form (`status` + rendered text).
    pub fn from_wire(status: Option<&str>, rendered: String) -> Self {
        match status {
            Some("error") => Answer::Failed(
                rendered
                    .strip_prefix(ERROR_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(rendered),
            ),
            _ => Answer::Text(rendered),
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Text(text) => f.write_str(text),
            Answer::Failed(details) => write!(f, "{}{}", ERROR_PREFIX, details),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct InferenceClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    caption_prompt: String,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.trim().to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            caption_prompt: config.caption_prompt.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn caption_prompt(&self) -> &str {
        &self.caption_prompt
    }

    pub fn request_body(&self, image_url: &str, prompt: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image_url}}
                ]
            }],
            "max_tokens": self.max_tokens
        })
    }

    pub async fn infer(&self, image_url: &str, prompt: &str) -> Result<String, InferenceError> {
        if self.api_key.is_empty() {
            return Err(InferenceError::MissingApiKey);
        }

        let start = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(image_url, prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_response(status.as_u16(), &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InferenceError::MalformedResponse("no message content".to_string()))?;

        debug!(
            "Inference with {} finished in {} ms",
            self.model,
            start.elapsed().as_millis()
        );
        Ok(content)
    }

    /// Never fails: any error becomes [`Answer::Failed`].
    pub async fn answer(&self, image_url: &str, query: &Query) -> Answer {
        match self.infer(image_url, query.prompt(&self.caption_prompt)).await {
            Ok(text) => Answer::Text(text),
            Err(e) => {
                warn!("{} inference failed: {}", query.kind(), e);
                Answer::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> InferenceClient {
        InferenceClient::new(&InferenceConfig {
            api_key: "sk-test".to_string(),
            ..InferenceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_request_body_shape() {
        let body = client().request_body("https://img/x.png", "What is this?");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 250);
        let content = &body["messages"][0]["content"];
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "What is this?");
        assert_eq!(content[1]["image_url"]["url"], "https://img/x.png");
    }

    #[test]
    fn test_query_prompt() {
        let caption = "Provide a short descriptive caption for this image.";
        assert_eq!(Query::Caption.prompt(caption), caption);
        assert_eq!(Query::vqa("How many cats?").prompt(caption), "How many cats?");
        assert_eq!(Query::vqa("x").kind(), "vqa");
    }

    #[test]
    fn test_answer_rendering() {
        assert_eq!(Answer::Text("A dog.".into()).to_string(), "A dog.");
        let failed = Answer::Failed("boom".into());
        assert_eq!(failed.to_string(), "❌ Error: boom");
        assert!(!failed.is_ok());
        assert_eq!(
            Answer::from_wire(Some("error"), failed.to_string()),
            failed
        );
        assert_eq!(
            Answer::from_wire(Some("ok"), "fine".to_string()),
            Answer::Text("fine".into())
        );
    }

    #[tokio::test]
    async fn test_missing_key_becomes_failed_answer() {
        let client = InferenceClient::new(&InferenceConfig::default()).unwrap();
        let answer = client.answer("/files/missing.png", &Query::Caption).await;
        assert!(answer.to_string().starts_with("❌ Error:"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_becomes_failed_answer() {
        let client = InferenceClient::new(&InferenceConfig {
            api_key: "sk-test".to_string(),
            base_url: "http://127.0.0.1:9/v1".to_string(),
            timeout_seconds: 2,
            ..InferenceConfig::default()
        })
        .unwrap();

        let answer = client
            .answer("https://img/x.png", &Query::vqa("describe"))
            .await;
        assert!(matches!(answer, Answer::Failed(_)));
    }
}
