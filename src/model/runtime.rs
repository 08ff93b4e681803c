// Location: src/model/runtime.rs

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama};
use std::time::Instant;

use crate::{
    config::GenerationConfig,
    error::{EngineError, Result},
    types::Completion,
};

use super::loader::{eos_token_ids, LoadedModel};
use super::tokenizer::TextTokenizer;

/// A loaded model plus everything needed to turn a prompt into text
pub struct ModelRuntime {
    model: Llama,
    config: Config,
    tokenizer: TextTokenizer,
    device: Device,
    dtype: DType,
    settings: GenerationConfig,
    eos_ids: Vec<u32>,
}

impl ModelRuntime {
    pub fn new(
        loaded: LoadedModel,
        tokenizer: TextTokenizer,
        device: Device,
        dtype: DType,
        settings: GenerationConfig,
    ) -> Self {
        let mut eos_ids = eos_token_ids(&loaded.config);
        if let Some(id) = tokenizer.special_tokens().eos_token_id {
            if !eos_ids.contains(&id) {
                eos_ids.push(id);
            }
        }

        Self {
            model: loaded.model,
            config: loaded.config,
            tokenizer,
            device,
            dtype,
            settings,
            eos_ids,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn settings(&self) -> &GenerationConfig {
        &self.settings
    }

    /// Number of tokens that may still be generated after a prompt of
    /// `prompt_len` tokens.
    pub fn new_token_budget(&self, prompt_len: usize) -> usize {
        let requested = match self.settings.max_new_tokens {
            Some(n) => n,
            None => self.settings.max_length.saturating_sub(prompt_len),
        };
        let positions_left = self.config.max_position_embeddings.saturating_sub(prompt_len);
        requested.min(positions_left)
    }

    /// Generate a continuation for `prompt`. Blocking; callers on an async
    /// runtime should move this onto a blocking thread.
    pub fn generate(&self, prompt: &str) -> Result<Completion> {
        let start_time = Instant::now();

        let prompt_ids = self.tokenizer.encode(prompt, self.settings.max_input_tokens)?;
        if prompt_ids.is_empty() {
            return Err(EngineError::Generation("prompt produced no tokens".to_string()));
        }
        let budget = self.new_token_budget(prompt_ids.len());

        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut logits_processor = self.logits_processor();
        let mut all_tokens = prompt_ids.clone();
        let mut generated = Vec::with_capacity(budget);
        let mut index_pos = 0;

        for step in 0..budget {
            // the whole prompt goes in first, then one token at a time
            let context = if step == 0 {
                &all_tokens[..]
            } else {
                &all_tokens[all_tokens.len() - 1..]
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, index_pos, &mut cache)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            index_pos += context.len();

            let logits = if self.settings.repeat_penalty != 1.0 {
                let start_at = all_tokens.len().saturating_sub(self.settings.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.settings.repeat_penalty,
                    &all_tokens[start_at..],
                )?
            } else {
                logits
            };

            let next_token = logits_processor.sample(&logits)?;
            all_tokens.push(next_token);
            generated.push(next_token);

            if self.eos_ids.contains(&next_token) {
                break;
            }
        }

        let text = if self.settings.echo_prompt {
            self.tokenizer.decode(&all_tokens, true)?
        } else {
            self.tokenizer.decode(&generated, true)?
        };

        let processing_time = start_time.elapsed();
        tracing::debug!(
            prompt_tokens = prompt_ids.len(),
            new_tokens = generated.len(),
            elapsed_ms = processing_time.as_millis() as u64,
            "generation finished"
        );

        Ok(Completion {
            text,
            prompt_tokens: prompt_ids.len(),
            tokens: generated,
            processing_time,
        })
    }

    fn logits_processor(&self) -> LogitsProcessor {
        let settings = &self.settings;
        let sampling = if settings.greedy || settings.temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            match settings.top_p {
                Some(p) => Sampling::TopP {
                    p,
                    temperature: settings.temperature,
                },
                None => Sampling::All {
                    temperature: settings.temperature,
                },
            }
        };
        LogitsProcessor::from_sampling(settings.seed, sampling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::loader::{load_for_inference, tests::write_tiny_checkpoint};
    use crate::model::tokenizer::tests::write_tokenizer;

    fn create_test_runtime(settings: GenerationConfig) -> (tempfile::TempDir, ModelRuntime) {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(dir.path());
        write_tokenizer(dir.path());

        let device = Device::Cpu;
        let loaded = load_for_inference(dir.path(), &device, DType::F32, false).unwrap();
        let tokenizer = TextTokenizer::from_dir(dir.path(), None).unwrap();
        let runtime = ModelRuntime::new(loaded, tokenizer, device, DType::F32, settings);
        (dir, runtime)
    }

    #[test]
    fn test_respects_max_length() {
        let settings = GenerationConfig {
            max_length: 8,
            ..Default::default()
        };
        let (_dir, runtime) = create_test_runtime(settings);

        let output = runtime.generate("hello world").unwrap();
        assert_eq!(output.prompt_tokens, 3);
        assert!(output.tokens.len() <= 5);
        assert!(output.text.starts_with("hello world"));
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let (_dir, runtime) = create_test_runtime(GenerationConfig {
            max_length: 12,
            ..Default::default()
        });

        let first = runtime.generate("how are you").unwrap();
        let second = runtime.generate("how are you").unwrap();
        assert_eq!(first.tokens, second.tokens);
        assert_eq!(first.text, second.text);
    }

    #[test]
    fn test_long_prompt_generates_nothing() {
        let (_dir, runtime) = create_test_runtime(GenerationConfig {
            max_length: 3,
            ..Default::default()
        });

        let output = runtime.generate("the mushroom is the forest").unwrap();
        assert!(output.tokens.is_empty());
        assert_eq!(output.text, "the mushroom is the forest");
    }

    #[test]
    fn test_max_new_tokens_overrides_length() {
        let (_dir, runtime) = create_test_runtime(GenerationConfig {
            max_length: 1,
            max_new_tokens: Some(2),
            echo_prompt: false,
            ..Default::default()
        });

        assert_eq!(runtime.new_token_budget(4), 2);
        let output = runtime.generate("hello").unwrap();
        assert_eq!(output.prompt_tokens, 2);
        assert!(output.tokens.len() <= 2);
    }

    #[test]
    fn test_budget_capped_by_positions() {
        let (_dir, runtime) = create_test_runtime(GenerationConfig {
            max_length: 1000,
            ..Default::default()
        });
        // tiny config has 64 positions
        assert_eq!(runtime.new_token_budget(60), 4);
    }

    #[test]
    fn test_sampling_with_seed() {
        let (_dir, runtime) = create_test_runtime(GenerationConfig {
            max_length: 10,
            greedy: false,
            temperature: 0.8,
            top_p: Some(0.9),
            ..Default::default()
        });

        let first = runtime.generate("hello").unwrap();
        let second = runtime.generate("hello").unwrap();
        assert_eq!(first.tokens, second.tokens);
    }
}
