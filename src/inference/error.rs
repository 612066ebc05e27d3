use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Inference API key is not configured")]
    MissingApiKey,

    #[error("API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider error {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Rate limited (429): {0}")]
    RateLimit(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    pub fn is_rate_limit(&self) -> bool {
        match self {
            InferenceError::RateLimit(_) => true,
            InferenceError::Provider { status, .. } => *status == 429,
            InferenceError::Request(e) => e.status().map(|s| s.as_u16() == 429).unwrap_or(false),
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            InferenceError::Provider { status, .. } => Some(*status),
            InferenceError::Request(e) => e.status().map(|s| s.as_u16()),
            InferenceError::RateLimit(_) => Some(429),
            _ => None,
        }
    }

    /// Build the error for a non-success HTTP response, pulling `error.message`
    /// out of OpenAI-style bodies when present.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string());

        if status == 429 {
            InferenceError::RateLimit(message)
        } else {
            InferenceError::Provider { status, message }
        }
    }
}
