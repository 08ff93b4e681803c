// Location: src/config.rs

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::error::{EngineError, Result};

/// Environment variable holding the hub access token
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

/// Environment variable overriding the model directory
pub const MODEL_DIR_ENV: &str = "MUSHROOM_MODEL_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub hub: HubConfig,
    pub datasets: DatasetsConfig,
    pub training: TrainingConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding config.json, tokenizer files and safetensors weights
    pub model_dir: PathBuf,

    /// Cache directory for downloaded dataset rows
    pub data_dir: PathBuf,

    /// Directory for training checkpoints
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DTypePreference {
    Auto,
    F32,
    F16,
    Bf16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Never reach out to the hub while serving; warn if the host is online
    pub offline: bool,

    pub device: DevicePreference,

    pub dtype: DTypePreference,

    /// Whether to use flash attention (requires the `flash-attn` feature)
    pub use_flash_attn: bool,

    /// Explicit tokenizer.json, tried before the model directory
    pub tokenizer_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Total length (prompt + continuation) in tokens
    pub max_length: usize,

    /// Number of new tokens; takes precedence over `max_length` when set
    pub max_new_tokens: Option<usize>,

    /// Prompts are truncated to this many tokens
    pub max_input_tokens: usize,

    /// Greedy decoding; sampling settings below are ignored when true
    pub greedy: bool,

    pub temperature: f64,

    pub top_p: Option<f64>,

    pub seed: u64,

    pub repeat_penalty: f32,

    pub repeat_last_n: usize,

    /// Return the prompt followed by the continuation
    pub echo_prompt: bool,

    /// Upper bound for a single completion, in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub repo_id: String,

    pub revision: String,

    pub endpoint: String,

    /// Access token; `HF_TOKEN` is used when absent
    pub token: Option<String>,

    /// Glob patterns of repository files to fetch
    pub allow_patterns: Vec<String>,

    pub max_retries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub dataset: String,
    #[serde(default = "default_dataset_config")]
    pub config: String,
    pub split: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetsConfig {
    /// Datasets-server endpoint used to page through rows
    pub endpoint: String,

    /// Training sources, concatenated in order
    pub sources: Vec<DatasetSpec>,

    pub eval_source: Option<DatasetSpec>,

    /// Rows per request (the server caps this at 100)
    pub page_size: usize,

    /// Per-source row cap, mostly useful for smoke runs
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub per_device_batch_size: usize,
    pub gradient_accumulation_steps: usize,

    /// Every example is padded or truncated to this many tokens
    pub max_length: usize,

    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,

    /// Number of checkpoints kept in the output directory
    pub save_total_limit: usize,

    pub load_best_model_at_end: bool,

    pub dtype: DTypePreference,

    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,

    pub source_location: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_dataset_config() -> String {
    "default".to_string()
}

impl DatasetSpec {
    pub fn new(dataset: &str, split: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            config: default_dataset_config(),
            split: split.to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("model"),
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("results"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            offline: true,
            device: DevicePreference::Auto,
            dtype: DTypePreference::Auto,
            use_flash_attn: false,
            tokenizer_file: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 100,
            max_new_tokens: None,
            max_input_tokens: 512,
            greedy: true,
            temperature: 0.7,
            top_p: Some(0.95),
            seed: 299792458,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            echo_prompt: true,
            request_timeout_secs: 60,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            repo_id: "mistralai/Mistral-7B-v0.3".to_string(),
            revision: "main".to_string(),
            endpoint: "https://huggingface.co".to_string(),
            token: None,
            allow_patterns: [
                "config.json",
                "generation_config.json",
                "tokenizer.json",
                "tokenizer.model",
                "tokenizer_config.json",
                "special_tokens_map.json",
                "model.safetensors.index.json",
                // skips the original-format `consolidated.safetensors`
                "model*.safetensors",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            max_retries: 3,
        }
    }
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://datasets-server.huggingface.co".to_string(),
            sources: vec![
                DatasetSpec::new("li2017dailydialog/daily_dialog", "train"),
                DatasetSpec::new("ParlAI/blended_skill_talk", "train"),
            ],
            eval_source: Some(DatasetSpec::new("ParlAI/blended_skill_talk", "validation")),
            page_size: 100,
            max_rows: None,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            per_device_batch_size: 2,
            gradient_accumulation_steps: 4,
            max_length: 128,
            learning_rate: 5e-5,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            save_total_limit: 2,
            load_best_model_at_end: true,
            dtype: DTypePreference::F32,
            seed: 42,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            file: None,
            source_location: false,
        }
    }
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl HubConfig {
    /// Explicit token, falling back to `HF_TOKEN`
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(HF_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty())
    }
}

impl AppConfig {
    /// Load a TOML configuration file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw).map_err(|e| {
            EngineError::config("file", format!("{}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Apply environment overrides on top of the loaded values
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
            if !dir.is_empty() {
                self.paths.model_dir = PathBuf::from(dir);
            }
        }
        if self.hub.token.is_none() {
            self.hub.token = std::env::var(HF_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.model_dir.as_os_str().is_empty() {
            return Err(EngineError::config("model_dir", "Model path cannot be empty"));
        }

        let generation = &self.generation;
        if generation.max_new_tokens.is_none() && generation.max_length == 0 {
            return Err(EngineError::config(
                "max_length",
                "max_length must be positive when max_new_tokens is unset",
            ));
        }
        if generation.max_input_tokens == 0 {
            return Err(EngineError::config("max_input_tokens", "must be positive"));
        }
        if generation.temperature < 0.0 {
            return Err(EngineError::config("temperature", "cannot be negative"));
        }
        if let Some(p) = generation.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(EngineError::config("top_p", "must be between 0 and 1"));
            }
        }

        if self.hub.repo_id.trim().is_empty() {
            return Err(EngineError::config("repo_id", "Repository id cannot be empty"));
        }

        let training = &self.training;
        if training.epochs == 0 {
            return Err(EngineError::config("epochs", "must be positive"));
        }
        if training.per_device_batch_size == 0 {
            return Err(EngineError::config("per_device_batch_size", "must be positive"));
        }
        if training.gradient_accumulation_steps == 0 {
            return Err(EngineError::config("gradient_accumulation_steps", "must be positive"));
        }
        if training.max_length < 2 {
            return Err(EngineError::config(
                "training.max_length",
                "needs at least two tokens to predict one",
            ));
        }
        if training.learning_rate <= 0.0 {
            return Err(EngineError::config("learning_rate", "must be positive"));
        }
        if training.save_total_limit == 0 {
            return Err(EngineError::config("save_total_limit", "must keep at least one checkpoint"));
        }

        if self.datasets.page_size == 0 || self.datasets.page_size > 100 {
            return Err(EngineError::config("page_size", "must be between 1 and 100"));
        }

        if self.server.bind.trim().is_empty() {
            return Err(EngineError::config("bind", "Bind address cannot be empty"));
        }

        Ok(())
    }
}
