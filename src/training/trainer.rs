use std::path::PathBuf;
use std::time::Instant;

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_transformers::models::llama::{Cache, Config, Llama};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::TrainingConfig,
    error::{EngineError, Result},
    model::{load_trainable, load_weights, save_pretrained, TextTokenizer, TrainableModel, WEIGHTS_FILE},
};

use super::batch::{Batch, TokenizedCorpus};
use super::checkpoint::CheckpointManager;

/// Per-epoch outcome
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub global_step: usize,
    pub train_loss: f64,
    pub eval_loss: Option<f64>,
    pub checkpoint: PathBuf,
}

/// Outcome of a training run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub global_steps: usize,
    pub epochs: Vec<EpochSummary>,
    pub best_checkpoint: Option<PathBuf>,
    /// Directory the final weights and tokenizer were written to
    pub model_dir: PathBuf,
}

/// Fine-tunes the checkpoint in `model_dir` in place
pub struct Trainer {
    config: TrainingConfig,
    model_dir: PathBuf,
    output_dir: PathBuf,
    device: Device,
    dtype: DType,
}

impl Trainer {
    pub fn new(
        config: TrainingConfig,
        model_dir: PathBuf,
        output_dir: PathBuf,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            config,
            model_dir,
            output_dir,
            device,
            dtype,
        }
    }

    /// Run the whole training loop. Blocking.
    pub fn train(
        &self,
        tokenizer: &TextTokenizer,
        train_texts: &[String],
        eval_texts: &[String],
    ) -> Result<TrainingReport> {
        let cfg = &self.config;
        let train = TokenizedCorpus::build(tokenizer, train_texts, cfg.max_length)?;
        if train.is_empty() {
            return Err(EngineError::Training("no training examples".to_string()));
        }
        let eval = TokenizedCorpus::build(tokenizer, eval_texts, cfg.max_length)?;

        let TrainableModel {
            model,
            varmap,
            config: model_config,
        } = load_trainable(&self.model_dir, &self.device, self.dtype)?;
        let vars = varmap.all_vars();

        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: cfg.learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: cfg.weight_decay,
            },
        )?;

        let batch_size = cfg.per_device_batch_size;
        let accum = cfg.gradient_accumulation_steps;
        let batches_per_epoch = train.num_batches(batch_size);
        let total_steps = batches_per_epoch.div_ceil(accum) * cfg.epochs;

        let mut checkpoints = CheckpointManager::new(&self.output_dir, cfg.save_total_limit)?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut global_step = 0;
        let mut epochs = Vec::with_capacity(cfg.epochs);

        tracing::info!(
            examples = train.len(),
            eval_examples = eval.len(),
            epochs = cfg.epochs,
            total_steps,
            "starting training"
        );

        for epoch in 1..=cfg.epochs {
            let start_time = Instant::now();
            order.shuffle(&mut rng);

            let mut accumulated: Option<GradStore> = None;
            let mut loss_sum = 0.0;
            let mut loss_batches = 0usize;

            for (i, batch) in train.batches(&order, batch_size, &self.device).enumerate() {
                let batch = batch?;
                if let Some(loss) = causal_lm_loss(&model, &model_config, &batch, self.dtype)? {
                    loss_sum += f64::from(loss.to_scalar::<f32>()?);
                    loss_batches += 1;

                    let grads = (loss / accum as f64)?.backward()?;
                    accumulated = Some(match accumulated.take() {
                        Some(acc) => merge_grads(acc, grads, &vars)?,
                        None => grads,
                    });
                }

                let boundary = (i + 1) % accum == 0 || i + 1 == batches_per_epoch;
                if !boundary {
                    continue;
                }
                let Some(mut grads) = accumulated.take() else {
                    continue;
                };

                let grad_norm = clip_grad_norm(&mut grads, &vars, cfg.max_grad_norm)?;
                let lr = linear_decay(cfg.learning_rate, global_step, total_steps);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;
                global_step += 1;
                tracing::debug!(step = global_step, lr, grad_norm, "optimizer step");
            }

            if loss_batches == 0 {
                return Err(EngineError::Training(
                    "no example has a token to predict".to_string(),
                ));
            }
            let train_loss = loss_sum / loss_batches as f64;
            let eval_loss = if eval.is_empty() {
                None
            } else {
                Some(evaluate(&model, &model_config, &eval, batch_size, &self.device, self.dtype)?)
            };
            tracing::info!(
                epoch,
                step = global_step,
                train_loss,
                eval_loss,
                elapsed_s = start_time.elapsed().as_secs(),
                "epoch finished"
            );

            let checkpoint = checkpoints.save(
                &varmap,
                &self.model_dir,
                global_step,
                epoch,
                Some(train_loss),
                eval_loss,
            )?;
            epochs.push(EpochSummary {
                epoch,
                global_step,
                train_loss,
                eval_loss,
                checkpoint,
            });
        }

        let best_checkpoint = checkpoints.best().map(|b| b.path.clone());
        if cfg.load_best_model_at_end {
            if let Some(best) = &best_checkpoint {
                tracing::info!(path = %best.display(), "loading best checkpoint");
                load_weights(&varmap, &[best.join(WEIGHTS_FILE)])?;
            }
        }

        save_pretrained(&varmap, &self.model_dir)?;
        tokenizer.save(&self.model_dir)?;
        tracing::info!(dir = %self.model_dir.display(), "saved fine-tuned model and tokenizer");

        Ok(TrainingReport {
            global_steps: global_step,
            epochs,
            best_checkpoint,
            model_dir: self.model_dir.clone(),
        })
    }
}

/// Next-token cross-entropy of a batch, averaged over non-padding targets.
///
/// The model only returns logits for the last input position, so the batch
/// is fed one position at a time through a KV cache. Returns `None` when no
/// example has a token to predict.
pub fn causal_lm_loss(
    model: &Llama,
    config: &Config,
    batch: &Batch,
    dtype: DType,
) -> Result<Option<Tensor>> {
    if batch.span < 2 || batch.target_tokens == 0 {
        return Ok(None);
    }
    let steps = batch.span - 1;
    let mut cache = Cache::new(true, dtype, config, batch.input_ids.device())?;

    let mut step_logits = Vec::with_capacity(steps);
    for pos in 0..steps {
        let input = batch.input_ids.narrow(1, pos, 1)?.contiguous()?;
        step_logits.push(model.forward(&input, pos, &mut cache)?);
    }
    let logits = Tensor::stack(&step_logits, 1)?;
    let targets = batch.labels.narrow(1, 1, steps)?;
    let mask = batch.attention_mask.narrow(1, 1, steps)?;

    masked_token_loss(&logits, &targets, &mask).map(Some)
}

/// Mean negative log-likelihood of `targets` (b, t) under `logits`
/// (b, t, vocab), counting only positions where `mask` is 1.
pub fn masked_token_loss(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Err(EngineError::Training("loss over zero target tokens".to_string()));
    }

    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.contiguous()?.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let total = (picked * mask)?.sum_all()?;
    Ok((total.neg()? / f64::from(count))?)
}

/// Token-weighted mean loss over a corpus, in order
fn evaluate(
    model: &Llama,
    config: &Config,
    corpus: &TokenizedCorpus,
    batch_size: usize,
    device: &Device,
    dtype: DType,
) -> Result<f64> {
    let order: Vec<usize> = (0..corpus.len()).collect();
    let mut weighted = 0.0;
    let mut tokens = 0usize;

    for batch in corpus.batches(&order, batch_size, device) {
        let batch = batch?;
        if let Some(loss) = causal_lm_loss(model, config, &batch, dtype)? {
            weighted += f64::from(loss.to_scalar::<f32>()?) * batch.target_tokens as f64;
            tokens += batch.target_tokens;
        }
    }

    if tokens == 0 {
        return Err(EngineError::Training(
            "evaluation set has no token to predict".to_string(),
        ));
    }
    Ok(weighted / tokens as f64)
}

/// Add the gradients of `grads` into `acc` for every variable
pub fn merge_grads(mut acc: GradStore, grads: GradStore, vars: &[Var]) -> Result<GradStore> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let merged = match acc.get(var.as_tensor()) {
            Some(prev) => (prev + grad)?,
            None => grad.clone(),
        };
        acc.insert(var.as_tensor(), merged);
    }
    Ok(acc)
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut squared = 0.0;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sum = grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
            squared += f64::from(sum);
        }
    }
    let norm = squared.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * scale)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(norm)
}

/// Learning rate after `step` of `total` steps, decaying linearly to zero
fn linear_decay(base: f64, step: usize, total: usize) -> f64 {
    if total == 0 {
        return base;
    }
    base * (1.0 - step as f64 / total as f64).max(0.0)
}
