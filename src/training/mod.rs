//! Fine-tuning on open dialogue datasets
//!
//! Rows are paged from the hub datasets server and cached locally, turned
//! into padded token batches, and used to train the local checkpoint with
//! a next-token cross-entropy objective.

mod batch;
mod checkpoint;
mod dataset;
mod trainer;

pub use batch::{Batch, TokenizedCorpus};
pub use checkpoint::{read_state, CheckpointManager, CheckpointRecord, TrainerState, TRAINER_STATE_FILE};
pub use dataset::{dialogue_text, DatasetFetcher};
pub use trainer::{
    causal_lm_loss, clip_grad_norm, masked_token_loss, merge_grads, EpochSummary, Trainer,
    TrainingReport,
};

use crate::{
    config::AppConfig,
    error::{EngineError, Result},
    model::{select_device, select_dtype, TextTokenizer},
};

/// Fetch the configured corpora and fine-tune the model in the model directory
pub async fn run_training(config: &AppConfig) -> Result<TrainingReport> {
    config.validate()?;
    let model_dir = config.paths.model_dir.clone();

    tracing::info!(dir = %model_dir.display(), "Loading model and tokenizer...");
    let tokenizer = TextTokenizer::from_dir(&model_dir, config.model.tokenizer_file.as_deref())?;

    tracing::info!("Loading datasets...");
    let fetcher = DatasetFetcher::new(&config.datasets, &config.paths.data_dir)?;
    let train_texts = fetcher.load_corpus(&config.datasets.sources).await?;
    let eval_texts = match &config.datasets.eval_source {
        Some(source) => fetcher.load_texts(source).await?,
        None => Vec::new(),
    };
    if train_texts.is_empty() {
        return Err(EngineError::Dataset("training corpus is empty".to_string()));
    }

    let device = select_device(config.model.device)?;
    let dtype = select_dtype(config.training.dtype, &device);
    let trainer = Trainer::new(
        config.training.clone(),
        model_dir,
        config.paths.output_dir.clone(),
        device,
        dtype,
    );

    tracing::info!(
        train = train_texts.len(),
        eval = eval_texts.len(),
        "Starting training..."
    );
    let report = tokio::task::spawn_blocking(move || {
        trainer.train(&tokenizer, &train_texts, &eval_texts)
    })
    .await
    .map_err(|e| EngineError::Training(format!("training task failed: {e}")))??;

    tracing::info!(steps = report.global_steps, "Training finished and model saved");
    Ok(report)
}
