use std::path::PathBuf;

use crate::{
    config::AppConfig,
    error::{EngineError, Result},
    model::{load_for_inference, select_device, select_dtype, ModelRuntime, TextTokenizer},
    utils::internet_accessible,
};

use super::engine::CompletionEngine;

/// Builder for constructing a CompletionEngine instance
pub struct EngineBuilder {
    config: Option<AppConfig>,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self { config: None }
    }

    /// Set the application configuration
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load the tokenizer and model and build the engine
    pub async fn build(self) -> Result<CompletionEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if config.model.offline && internet_accessible().await {
            tracing::warn!("Active internet connection detected. Ensure firewall restrictions if needed.");
        }

        tracing::info!(dir = %config.paths.model_dir.display(), "Loading model...");
        let device = select_device(config.model.device)?;
        let dtype = select_dtype(config.model.dtype, &device);

        let model_dir: PathBuf = config.paths.model_dir.clone();
        let tokenizer_file = config.model.tokenizer_file.clone();
        let use_flash_attn = config.model.use_flash_attn;
        let settings = config.generation.clone();

        // mmap and weight conversion are blocking work
        let runtime = tokio::task::spawn_blocking(move || -> Result<(ModelRuntime, PathBuf)> {
            let tokenizer = TextTokenizer::from_dir(&model_dir, tokenizer_file.as_deref())
                .inspect_err(|e| tracing::error!("Error loading tokenizer: {e}"))?;
            let loaded = load_for_inference(&model_dir, &device, dtype, use_flash_attn)
                .inspect_err(|e| tracing::error!("Error loading model: {e}"))?;
            let runtime = ModelRuntime::new(loaded, tokenizer, device, dtype, settings);
            Ok((runtime, model_dir))
        })
        .await
        .map_err(|e| EngineError::Initialization {
            message: "model loading task failed".to_string(),
            source: Some(Box::new(e)),
        })?;

        let (runtime, model_dir) = runtime?;
        let engine = CompletionEngine::new(runtime, model_dir);
        let info = engine.info();
        tracing::info!(
            dir = %info.model_dir.display(),
            device = %info.device,
            max_length = info.max_length,
            timeout = ?info.timeout,
            "Model and tokenizer loaded"
        );
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
