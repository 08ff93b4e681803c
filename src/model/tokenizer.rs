// Location: src/model/tokenizer.rs

use std::path::{Path, PathBuf};
use tokenizers::Tokenizer as HfTokenizer;

use crate::error::{EngineError, Result};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Wrapper around a Hugging Face tokenizer with the special tokens the
/// generation and training loops need.
pub struct TextTokenizer {
    tokenizer: HfTokenizer,
    special_tokens: SpecialTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    /// Falls back to the EOS token when the checkpoint defines none
    pub pad_token_id: u32,
}

/// Token ids of a padded batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub token_ids: Vec<Vec<u32>>,
    pub attention_masks: Vec<Vec<u8>>,
}

impl TextTokenizer {
    /// Load the tokenizer of a local checkpoint.
    ///
    /// Candidates are tried in order: the explicit override, then
    /// `<dir>/tokenizer.json`, then `<dir>/tokenizer/tokenizer.json`.
    pub fn from_dir(model_dir: impl AsRef<Path>, override_file: Option<&Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(file) = override_file {
            candidates.push(file.to_path_buf());
        }
        candidates.push(model_dir.join(TOKENIZER_FILE));
        candidates.push(model_dir.join("tokenizer").join(TOKENIZER_FILE));

        let mut last_error = String::from("no tokenizer candidates");
        for path in &candidates {
            match HfTokenizer::from_file(path) {
                Ok(tokenizer) => {
                    tracing::info!(path = %path.display(), "tokenizer loaded");
                    let config_dir = path.parent().unwrap_or(model_dir);
                    return Self::with_config(tokenizer, config_dir);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), "failed to load tokenizer: {e}");
                    last_error = format!("{}: {}", path.display(), e);
                }
            }
        }

        tracing::error!(dir = %model_dir.display(), "no usable tokenizer found");
        Err(EngineError::Initialization {
            message: format!("Error loading tokenizer ({last_error})"),
            source: None,
        })
    }

    /// Wrap an already constructed tokenizer, reading special tokens from
    /// `tokenizer_config.json` in `config_dir` when it exists.
    pub fn with_config(tokenizer: HfTokenizer, config_dir: &Path) -> Result<Self> {
        let config = read_tokenizer_config(config_dir)?;
        let lookup = |key: &str, fallback: &str| {
            special_token_name(config.as_ref(), key)
                .and_then(|name| tokenizer.token_to_id(&name))
                .or_else(|| tokenizer.token_to_id(fallback))
        };

        let bos_token_id = lookup("bos_token", "<s>");
        let eos_token_id = lookup("eos_token", "</s>");
        let pad_token_id = special_token_name(config.as_ref(), "pad_token")
            .and_then(|name| tokenizer.token_to_id(&name))
            .or(eos_token_id)
            .ok_or_else(|| {
                EngineError::tokenizer("tokenizer defines neither a pad nor an eos token")
            })?;

        Ok(Self {
            tokenizer,
            special_tokens: SpecialTokens {
                bos_token_id,
                eos_token_id,
                pad_token_id,
            },
        })
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    /// Encode text with special tokens, keeping at most `max_tokens` ids
    pub fn encode(&self, text: &str, max_tokens: usize) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EngineError::tokenizer(format!("Tokenization failed: {e}")))?;

        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(max_tokens);
        Ok(ids)
    }

    /// Encode every text to exactly `max_length` ids, right-padded with the
    /// pad token and masked accordingly.
    pub fn encode_padded(&self, texts: &[String], max_length: usize) -> Result<PaddedBatch> {
        let mut token_ids = Vec::with_capacity(texts.len());
        let mut attention_masks = Vec::with_capacity(texts.len());

        for text in texts {
            let mut ids = self.encode(text, max_length)?;
            let mut mask = vec![1u8; ids.len()];
            let pad_len = max_length - ids.len();
            ids.extend(std::iter::repeat(self.special_tokens.pad_token_id).take(pad_len));
            mask.extend(std::iter::repeat(0u8).take(pad_len));
            token_ids.push(ids);
            attention_masks.push(mask);
        }

        Ok(PaddedBatch {
            token_ids,
            attention_masks,
        })
    }

    /// Decode token ids back to text
    pub fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(|e| EngineError::tokenizer(format!("Decoding failed: {e}")))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Write `tokenizer.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(TOKENIZER_FILE);
        self.tokenizer
            .save(&path, false)
            .map_err(|e| EngineError::tokenizer(format!("Saving {} failed: {e}", path.display())))
    }
}

fn read_tokenizer_config(dir: &Path) -> Result<Option<serde_json::Value>> {
    let path = dir.join(TOKENIZER_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Special tokens appear either as plain strings or as `{"content": ...}`
fn special_token_name(config: Option<&serde_json::Value>, key: &str) -> Option<String> {
    match config?.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}
