//! Checkpoint directories with rotation and best-model tracking

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{CONFIG_FILE, WEIGHTS_FILE},
};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Contents of `trainer_state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub eval_loss: Option<f64>,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub step: usize,
    pub path: PathBuf,
    /// Only checkpoints written by this run carry a metric
    pub eval_loss: Option<f64>,
}

/// Saves `checkpoint-<step>` directories and keeps at most
/// `save_total_limit` of them, never removing the best or the newest one.
#[derive(Debug)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: usize,
    records: Vec<CheckpointRecord>,
    best: Option<usize>,
}

impl CheckpointManager {
    /// Open `output_dir`, picking up checkpoints left by earlier runs so
    /// they count against the limit.
    pub fn new(output_dir: impl Into<PathBuf>, save_total_limit: usize) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        let mut records = Vec::new();
        for entry in std::fs::read_dir(&output_dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let (Some(step), true) = (step, path.is_dir()) {
                records.push(CheckpointRecord {
                    step,
                    path,
                    eval_loss: None,
                });
            }
        }
        records.sort_by_key(|r| r.step);
        if !records.is_empty() {
            tracing::debug!(count = records.len(), "found existing checkpoints");
        }

        Ok(Self {
            output_dir,
            save_total_limit: save_total_limit.max(1),
            records,
            best: None,
        })
    }

    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// Best checkpoint of this run by evaluation loss
    pub fn best(&self) -> Option<&CheckpointRecord> {
        let step = self.best?;
        self.records.iter().find(|r| r.step == step)
    }

    /// Write weights, model config and trainer state, then rotate
    pub fn save(
        &mut self,
        varmap: &VarMap,
        model_dir: &Path,
        global_step: usize,
        epoch: usize,
        train_loss: Option<f64>,
        eval_loss: Option<f64>,
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path(global_step);
        std::fs::create_dir_all(&path)?;
        varmap.save(path.join(WEIGHTS_FILE))?;

        let config = model_dir.join(CONFIG_FILE);
        if config.exists() {
            std::fs::copy(&config, path.join(CONFIG_FILE))?;
        }

        self.records.retain(|r| r.step != global_step);
        self.records.push(CheckpointRecord {
            step: global_step,
            path: path.clone(),
            eval_loss,
        });
        self.records.sort_by_key(|r| r.step);

        if let Some(loss) = eval_loss {
            let improved = self
                .best()
                .and_then(|b| b.eval_loss)
                .map_or(true, |best| loss < best);
            if improved {
                self.best = Some(global_step);
            }
        }

        let best = self.best();
        let state = TrainerState {
            global_step,
            epoch,
            train_loss,
            eval_loss,
            best_metric: best.and_then(|b| b.eval_loss),
            best_model_checkpoint: best.map(|b| b.path.clone()),
        };
        std::fs::write(path.join(TRAINER_STATE_FILE), serde_json::to_vec_pretty(&state)?)?;
        tracing::info!(step = global_step, path = %path.display(), "saved checkpoint");

        self.rotate()?;
        Ok(path)
    }

    fn rotate(&mut self) -> Result<()> {
        let newest = self.records.last().map(|r| r.step);
        while self.records.len() > self.save_total_limit {
            let Some(index) = self
                .records
                .iter()
                .position(|r| Some(r.step) != self.best && Some(r.step) != newest)
            else {
                break;
            };
            let record = self.records.remove(index);
            tracing::info!(path = %record.path.display(), "deleting older checkpoint");
            std::fs::remove_dir_all(&record.path)?;
        }
        Ok(())
    }
}

/// Read the trainer state of a checkpoint directory
pub fn read_state(checkpoint: &Path) -> Result<TrainerState> {
    let raw = std::fs::read(checkpoint.join(TRAINER_STATE_FILE))?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;
    use pretty_assertions::assert_eq;

    fn varmap() -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 2), "w", Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    fn steps(manager: &CheckpointManager) -> Vec<usize> {
        manager.records().iter().map(|r| r.step).collect()
    }

    #[test]
    fn test_rotation_keeps_limit() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let vars = varmap();

        for (step, loss) in [(10, 3.0), (20, 2.0), (30, 1.0)] {
            manager
                .save(&vars, model_dir.path(), step, step / 10, None, Some(loss))
                .unwrap();
        }

        assert_eq!(steps(&manager), vec![20, 30]);
        assert!(!dir.path().join("checkpoint-10").exists());
        assert!(dir.path().join("checkpoint-30").join(WEIGHTS_FILE).exists());
        assert_eq!(manager.best().unwrap().step, 30);
    }

    #[test]
    fn test_best_checkpoint_survives_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        std::fs::write(model_dir.path().join(CONFIG_FILE), "{}").unwrap();
        let mut manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let vars = varmap();

        for (step, loss) in [(1, 0.5), (2, 0.9), (3, 0.8), (4, 0.7)] {
            manager.save(&vars, model_dir.path(), step, step, None, Some(loss)).unwrap();
        }

        assert_eq!(steps(&manager), vec![1, 4]);
        let best = manager.best().unwrap();
        assert_eq!(best.step, 1);
        assert!(best.path.join(CONFIG_FILE).exists());

        let state = read_state(&dir.path().join("checkpoint-4")).unwrap();
        assert_eq!(state.global_step, 4);
        assert_eq!(state.eval_loss, Some(0.7));
        assert_eq!(state.best_metric, Some(0.5));
        assert_eq!(state.best_model_checkpoint, Some(best.path.clone()));
    }

    #[test]
    fn test_existing_checkpoints_count_against_limit() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("checkpoint-5")).unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-checkpoint")).unwrap();

        let mut manager = CheckpointManager::new(dir.path(), 1).unwrap();
        assert_eq!(steps(&manager), vec![5]);

        manager.save(&varmap(), model_dir.path(), 6, 1, Some(1.0), None).unwrap();
        assert_eq!(steps(&manager), vec![6]);
        assert!(!dir.path().join("checkpoint-5").exists());
        assert!(dir.path().join("not-a-checkpoint").exists());
        assert!(manager.best().is_none());
    }
}
