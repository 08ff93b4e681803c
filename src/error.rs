use std::time::Duration;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Initialization error: {message}")]
    Initialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Model error: {message}")]
    Model {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Configuration error for {parameter}: {message}")]
    Configuration { parameter: String, message: String },

    #[error("Download of {url} failed: {message}")]
    Download {
        url: String,
        message: String,
        retryable: bool,
    },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub(crate) fn config(parameter: &str, message: impl Into<String>) -> Self {
        EngineError::Configuration {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        EngineError::Tokenizer(err.to_string())
    }
}

/// Extension trait for error handling utilities
pub(crate) trait ErrorExt {
    /// Whether retrying the same operation may succeed
    fn is_retryable(&self) -> bool;
}

impl ErrorExt for EngineError {
    fn is_retryable(&self) -> bool {
        match self {
            EngineError::Download { retryable, .. } => *retryable,
            EngineError::Timeout { .. } => true,
            EngineError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    // connection dropped mid-body
                    || e.is_body()
                    || e.is_decode()
                    || e.status().is_some_and(is_transient_status)
            }
            _ => false,
        }
    }
}

/// 5xx and 429 responses are worth another attempt
pub(crate) fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}
