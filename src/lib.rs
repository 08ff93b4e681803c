//! Mushroom AI - local language model chat, fine-tuning and model download
//!
//! This crate loads a pretrained causal language model from a local
//! directory and serves completions from an interactive loop or a small
//! HTTP API. It can also fine-tune that model on open dialogue datasets
//! and fetch model and tokenizer files from the Hugging Face hub.

use std::fmt;
#[cfg(feature = "cuda")]
use candle_core::Device;

// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod model;
pub mod server;
pub mod training;
pub mod types;
pub mod utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::AppConfig;
pub use engine::{ChatLoop, Completer, CompletionEngine, EngineBuilder, RemoteCompleter};
pub use error::{EngineError, Result};
pub use hub::{DownloadReport, Downloader};
pub use server::{serve, ServeHandle};
pub use training::{run_training, TrainingReport};
pub use types::{Completion, FALLBACK_RESPONSE};
pub use utils::{setup_logging, LogConfig};

/// Feature detection for supported backends
pub struct Features {
    /// Whether CUDA support is compiled in
    pub cuda: bool,
    /// Number of usable CUDA devices
    pub cuda_devices: usize,
    /// Whether flash attention is compiled in
    pub flash_attn: bool,
}

impl Features {
    /// Detect available features at runtime
    pub fn detect() -> Self {
        #[cfg(feature = "cuda")]
        let (cuda, cuda_devices) = {
            let count = (0..8).take_while(|&i| Device::new_cuda(i).is_ok()).count();
            (count > 0, count)
        };

        #[cfg(not(feature = "cuda"))]
        let (cuda, cuda_devices) = (false, 0);

        Self {
            cuda,
            cuda_devices,
            flash_attn: cfg!(feature = "flash-attn"),
        }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        if self.cuda {
            writeln!(f, "CUDA devices: {}", self.cuda_devices)?;
        }
        writeln!(f, "Flash attention: {}", if self.flash_attn { "yes" } else { "no" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_detection() {
        let features = Features::detect();
        println!("Detected features:\n{}", features);
        if !features.cuda {
            assert_eq!(features.cuda_devices, 0);
            assert!(features.to_string().contains("CUDA support: no"));
        }
    }

    #[test]
    fn test_version_number() {
        assert!(!VERSION.is_empty());
    }
}
