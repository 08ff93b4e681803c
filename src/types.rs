//! Common type definitions shared by the engine, the HTTP API and the CLI

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Text returned to the user when a completion fails
pub const FALLBACK_RESPONSE: &str = "An error occurred while generating the response.";

/// Result of a single completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Decoded text (prompt and continuation unless echo is disabled)
    pub text: String,
    /// Number of prompt tokens after truncation
    pub prompt_tokens: usize,
    /// Newly generated token ids
    pub tokens: Vec<u32>,
    /// Time taken to generate
    pub processing_time: Duration,
}

impl Completion {
    /// A completion that carries only text, used by remote backends
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompt_tokens: 0,
            tokens: Vec::new(),
            processing_time: Duration::default(),
        }
    }
}

/// Body of `POST /api/chat/generate`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Successful response of `POST /api/chat/generate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

/// Error body returned by the HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Response of `GET /api/chat/healthcheck`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_prompt() {
        let req: GenerateRequest = serde_json::from_str("{}").unwrap();
        assert!(req.prompt.is_none());

        let req: GenerateRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(req.prompt.as_deref(), Some("hi"));
    }

    #[test]
    fn test_error_body_omits_missing_details() {
        let body = ErrorBody {
            error: "Invalid request, 'prompt' missing".to_string(),
            details: None,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"error":"Invalid request, 'prompt' missing"}"#
        );
    }
}
