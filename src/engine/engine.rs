use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::{
    error::{EngineError, Result},
    model::ModelRuntime,
    types::{Completion, FALLBACK_RESPONSE},
};

use super::{builder::EngineBuilder, Completer};

/// Serves completions from a locally loaded model
pub struct CompletionEngine {
    runtime: Arc<ModelRuntime>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    model_dir: PathBuf,
}

/// Information about the engine's state
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub model_dir: PathBuf,
    pub device: String,
    pub max_length: usize,
    pub timeout: Duration,
}

impl CompletionEngine {
    /// Create a new engine builder
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn new(runtime: ModelRuntime, model_dir: PathBuf) -> Self {
        let timeout = runtime.settings().request_timeout();
        Self {
            runtime: Arc::new(runtime),
            // one generation at a time; the model and its KV cache own the device
            permits: Arc::new(Semaphore::new(1)),
            timeout,
            model_dir,
        }
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            model_dir: self.model_dir.clone(),
            device: format!("{:?}", self.runtime.device()),
            max_length: self.runtime.settings().max_length,
            timeout: self.timeout,
        }
    }

    /// Generate on the blocking pool, bounded by the request timeout
    pub async fn generate(&self, prompt: &str) -> Result<Completion> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Generation("engine is shutting down".to_string()))?;

        let runtime = self.runtime.clone();
        let prompt = prompt.to_string();
        let task = tokio::task::spawn_blocking(move || {
            // held until the work is done, even if the caller gave up
            let _permit = permit;
            runtime.generate(&prompt)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::Generation(format!("generation task failed: {e}"))),
            Err(_) => Err(EngineError::Timeout {
                operation: "generate".to_string(),
                duration: self.timeout,
            }),
        }
    }

    /// Generate, answering with the fixed fallback text on any failure
    pub async fn respond(&self, prompt: &str) -> String {
        match self.generate(prompt).await {
            Ok(completion) => completion.text,
            Err(e) => {
                tracing::error!("Error generating response: {e}");
                FALLBACK_RESPONSE.to_string()
            }
        }
    }
}

#[async_trait::async_trait]
impl Completer for CompletionEngine {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        self.generate(prompt).await
    }
}
