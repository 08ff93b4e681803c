use candle_core::{safetensors::MmapedSafetensors, DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::llama::{Config, Llama, LlamaConfig, LlamaEosToks};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// A model ready for inference
pub struct LoadedModel {
    pub model: Llama,
    pub config: Config,
}

/// A model whose weights live in a `VarMap` so they can be optimized
pub struct TrainableModel {
    pub model: Llama,
    pub varmap: VarMap,
    pub config: Config,
}

/// Parse `config.json` of a Llama-family checkpoint (Mistral shares the layout)
pub fn read_llama_config(dir: &Path) -> Result<LlamaConfig> {
    let path = dir.join(CONFIG_FILE);
    let raw = std::fs::read(&path).map_err(|e| EngineError::Model {
        message: format!("Failed to read {}", path.display()),
        source: Some(Box::new(e)),
    })?;
    serde_json::from_slice(&raw).map_err(|e| EngineError::Model {
        message: format!("Invalid model configuration in {}", path.display()),
        source: Some(Box::new(e)),
    })
}

/// Safetensors shards of a checkpoint, from the shard index when present
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    let files: Vec<PathBuf> = if index_path.exists() {
        let index: serde_json::Value = serde_json::from_slice(&std::fs::read(&index_path)?)?;
        let weight_map = index
            .get("weight_map")
            .and_then(|m| m.as_object())
            .ok_or_else(|| EngineError::Model {
                message: format!("{} has no weight_map", index_path.display()),
                source: None,
            })?;
        weight_map
            .values()
            .filter_map(|v| v.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else {
        let mut files = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                let is_model_file = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("model") && n.ends_with(".safetensors"));
                if is_model_file {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
    };

    if files.is_empty() {
        return Err(EngineError::Model {
            message: format!("No safetensors weights found in {}", dir.display()),
            source: None,
        });
    }
    if let Some(missing) = files.iter().find(|f| !f.exists()) {
        return Err(EngineError::Model {
            message: format!("Missing weight shard {}", missing.display()),
            source: None,
        });
    }
    Ok(files)
}

/// Load a checkpoint for inference using memory-mapped safetensors
pub fn load_for_inference(
    dir: &Path,
    device: &Device,
    dtype: DType,
    use_flash_attn: bool,
) -> Result<LoadedModel> {
    let config = read_llama_config(dir)?.into_config(use_flash_attn);
    let files = weight_files(dir)?;
    tracing::info!(shards = files.len(), ?dtype, "loading model weights");

    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, device)? };
    let model = Llama::load(vb, &config).map_err(|e| EngineError::Model {
        message: format!("Failed to load model from {}", dir.display()),
        source: Some(Box::new(e)),
    })?;

    Ok(LoadedModel { model, config })
}

/// Load a checkpoint into trainable variables
pub fn load_trainable(dir: &Path, device: &Device, dtype: DType) -> Result<TrainableModel> {
    let config = read_llama_config(dir)?.into_config(false);
    let files = weight_files(dir)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let model = Llama::load(vb, &config)?;
    load_weights(&varmap, &files)?;
    tracing::info!(shards = files.len(), ?dtype, "loaded trainable model");

    Ok(TrainableModel {
        model,
        varmap,
        config,
    })
}

/// Overwrite every variable of `varmap` with the tensor of the same name
pub fn load_weights(varmap: &VarMap, files: &[PathBuf]) -> Result<()> {
    let tensors = unsafe { MmapedSafetensors::multi(files)? };
    let data = varmap
        .data()
        .lock()
        .map_err(|_| EngineError::Training("variable store lock poisoned".to_string()))?;

    for (name, var) in data.iter() {
        let tensor = tensors.load(name, var.device())?.to_dtype(var.dtype())?;
        var.set(&tensor).map_err(|e| EngineError::Model {
            message: format!("Weight {name} does not fit the model"),
            source: Some(Box::new(e)),
        })?;
    }
    Ok(())
}

/// Write the variables as a single `model.safetensors`, removing shards and
/// the shard index left by an earlier checkpoint layout.
pub fn save_pretrained(varmap: &VarMap, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(WEIGHTS_FILE);
    varmap.save(&target)?;

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == WEIGHTS_INDEX_FILE || is_shard_file(name) {
            tracing::debug!(file = name, "removing stale weight file");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(target)
}

/// `model-00001-of-00003.safetensors`
fn is_shard_file(name: &str) -> bool {
    name.strip_prefix("model-")
        .and_then(|rest| rest.strip_suffix(".safetensors"))
        .is_some_and(|rest| rest.contains("-of-"))
}

/// EOS ids announced by the model configuration
pub fn eos_token_ids(config: &Config) -> Vec<u32> {
    match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TINY_CONFIG: &str = r#"{
        "architectures": ["MistralForCausalLM"],
        "hidden_size": 8,
        "intermediate_size": 16,
        "vocab_size": 12,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "max_position_embeddings": 64,
        "bos_token_id": 1,
        "eos_token_id": 2
    }"#;

    /// Write a randomly initialised tiny checkpoint into `dir`
    pub(crate) fn write_tiny_checkpoint(dir: &Path) {
        std::fs::write(dir.join(CONFIG_FILE), TINY_CONFIG).unwrap();
        let config = read_llama_config(dir).unwrap().into_config(false);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Llama::load(vb, &config).unwrap();
        varmap.save(dir.join(WEIGHTS_FILE)).unwrap();
    }

    #[test]
    fn test_read_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), TINY_CONFIG).unwrap();

        let config = read_llama_config(dir.path()).unwrap().into_config(false);
        assert_eq!(config.hidden_size, 8);
        assert_eq!(config.vocab_size, 12);
        assert_eq!(eos_token_ids(&config), vec![2]);
    }

    #[test]
    fn test_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_llama_config(dir.path()),
            Err(EngineError::Model { .. })
        ));
    }

    #[test]
    fn test_weight_files_from_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();
        std::fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();

        let files = weight_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_weight_files_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"a": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        assert!(weight_files(dir.path()).is_err());
    }

    #[test]
    fn test_weight_files_ignore_consolidated_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        std::fs::write(dir.path().join("consolidated.safetensors"), b"").unwrap();

        let files = weight_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join(WEIGHTS_FILE)]);
    }

    #[test]
    fn test_no_weights() {
        let dir = tempfile::tempdir().unwrap();
        assert!(weight_files(dir.path()).is_err());
    }

    #[test]
    fn test_shard_names() {
        assert!(is_shard_file("model-00001-of-00003.safetensors"));
        assert!(!is_shard_file("model.safetensors"));
        assert!(!is_shard_file("consolidated.safetensors"));
    }

    #[test]
    fn test_load_tiny_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(dir.path());

        let loaded = load_for_inference(dir.path(), &Device::Cpu, DType::F32, false).unwrap();
        assert_eq!(loaded.config.num_hidden_layers, 1);

        let trainable = load_trainable(dir.path(), &Device::Cpu, DType::F32).unwrap();
        assert!(!trainable.varmap.all_vars().is_empty());
    }

    #[test]
    fn test_save_pretrained_replaces_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(dir.path());
        let trainable = load_trainable(dir.path(), &Device::Cpu, DType::F32).unwrap();

        std::fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"stale").unwrap();
        std::fs::write(dir.path().join(WEIGHTS_INDEX_FILE), b"{}").unwrap();

        save_pretrained(&trainable.varmap, dir.path()).unwrap();
        assert!(dir.path().join(WEIGHTS_FILE).exists());
        assert!(!dir.path().join("model-00001-of-00002.safetensors").exists());
        assert!(!dir.path().join(WEIGHTS_INDEX_FILE).exists());
        assert_eq!(weight_files(dir.path()).unwrap().len(), 1);
    }
}
