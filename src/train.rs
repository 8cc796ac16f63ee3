//! Training loops for the embedding models and the language model
//!
//! All three models share one loop: Adam without weight decay, a step learning rate schedule
//! advanced after every batch, and a checkpoint before training and after each epoch.

use std::{path::PathBuf, time::Instant};

use candle_core::Tensor;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    checkpoint::{CheckpointError, checkpoint_name, save_checkpoint},
    dataloader::{DataLoader, DataLoaderError},
    datasets::{CooccurrenceDataset, Dataset, LanguageModelDataset, SkipGramDataset},
    glove::GloVe,
    loss::{CrossEntropyLoss, GloveLoss, Word2VecLoss},
    nn::{Module, NNError, Parameters},
    optim::{Adam, AdamParams, Optim, OptimError, StepLR, clip_grad_norm},
    skipgram::SkipGram,
    transformer::TransformerLM,
};

/// Errors raised while training
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Loss became {value} at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, value: f32 },
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Settings shared by every training loop
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    pub seed: u64,
    pub output_dir: PathBuf,
    /// Log the running loss every this many batches
    pub log_every: usize,
    /// Halve (by default) the learning rate every this many batches
    pub lr_step_size: usize,
    pub lr_gamma: f64,
    pub max_grad_norm: Option<f64>,
    pub shuffle: bool,
    pub save_checkpoints: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            epochs: 10,
            lr: 0.001,
            seed: 42,
            output_dir: PathBuf::from("checkpoints"),
            log_every: 100,
            lr_step_size: 1000,
            lr_gamma: 0.5,
            max_grad_norm: None,
            shuffle: true,
            save_checkpoints: true,
        }
    }
}

/// Losses recorded during a run
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    /// Loss of every batch, in order
    pub step_losses: Vec<f32>,
    /// Loss of the last batch of each epoch
    pub epoch_losses: Vec<f32>,
    /// Lowest batch loss within each epoch
    pub epoch_min_losses: Vec<f32>,
    /// Lowest batch loss of the whole run
    pub min_loss: Option<f32>,
}

impl TrainReport {
    fn record(&mut self, loss: f32) {
        self.step_losses.push(loss);
        self.min_loss = Some(self.min_loss.map_or(loss, |m| m.min(loss)));
    }
}

fn checkpoint<M: Parameters + ?Sized>(
    model: &M,
    config: &TrainConfig,
    model_name: &str,
    epoch: Option<usize>,
    loss: Option<f32>,
) -> Result<(), TrainError> {
    if config.save_checkpoints {
        let name = checkpoint_name(model_name, epoch, loss, config.lr, config.batch_size);
        save_checkpoint(model, &config.output_dir, &name)?;
    }
    Ok(())
}

/// Runs the shared training loop. `compute_loss` turns one batch into a scalar loss and may
/// draw from the run's seeded rng (e.g. for negative sampling).
fn fit<D, M, F>(
    model_name: &str,
    dataset: &D,
    model: &M,
    config: &TrainConfig,
    mut compute_loss: F,
) -> Result<TrainReport, TrainError>
where
    D: Dataset,
    M: Parameters + ?Sized,
    F: FnMut(&[D::Item], &mut Pcg64Mcg) -> Result<Tensor, TrainError>,
{
    let mut rng = Pcg64Mcg::seed_from_u64(config.seed);
    let loader = DataLoader::new(dataset, config.batch_size, config.shuffle, false)?;
    let params = model.parameters();
    let mut optim = Adam::new(
        params.clone(),
        AdamParams {
            lr: config.lr,
            ..Default::default()
        },
    )?;
    let mut scheduler = StepLR::new(&optim, config.lr_step_size, config.lr_gamma)?;
    let log_every = config.log_every.max(1);

    log::info!(
        "Training {model_name} ({} parameters) for {} epochs of {} batches",
        model.num_parameters(),
        config.epochs,
        loader.num_batches()
    );
    checkpoint(model, config, model_name, None, None)?;

    let mut report = TrainReport::default();
    for epoch in 0..config.epochs {
        let start = Instant::now();
        log::info!("Epoch {}/{} started", epoch + 1, config.epochs);
        let mut last_loss = None;
        let mut epoch_min = f32::INFINITY;
        for (step, batch) in loader.iter_with_rng(&mut rng).enumerate() {
            let loss = compute_loss(&batch, &mut rng)?;
            let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
            if !value.is_finite() {
                return Err(TrainError::NonFiniteLoss { epoch, step, value });
            }
            let mut grads = loss.backward()?;
            if let Some(max_norm) = config.max_grad_norm {
                let norm = clip_grad_norm(&mut grads, &params, max_norm)?;
                log::trace!("step {step}: gradient norm {norm:.4}");
            }
            optim.step(&grads)?;
            scheduler.step(&mut optim);
            report.record(value);
            epoch_min = epoch_min.min(value);
            last_loss = Some(value);

            if (step + 1) % log_every == 0 {
                log::info!(
                    "epoch {} step {}/{}: loss {:.4} (epoch min {:.4}), lr {:.2e}",
                    epoch + 1,
                    step + 1,
                    loader.num_batches(),
                    value,
                    epoch_min,
                    optim.learning_rate()
                );
            }
        }
        if let Some(loss) = last_loss {
            report.epoch_losses.push(loss);
            report.epoch_min_losses.push(epoch_min);
        }
        log::info!(
            "Epoch {}/{} finished in {}s, loss {:.4}, epoch min {:.4}",
            epoch + 1,
            config.epochs,
            start.elapsed().as_secs(),
            last_loss.unwrap_or(f32::NAN),
            epoch_min
        );
        checkpoint(model, config, model_name, Some(epoch), last_loss)?;
    }
    Ok(report)
}

pub fn train_skipgram(
    dataset: &SkipGramDataset,
    model: &SkipGram,
    config: &TrainConfig,
) -> Result<TrainReport, TrainError> {
    let device = model.device().clone();
    fit("skipgram", dataset, model, config, |batch, rng| {
        let (center, context): (Vec<u32>, Vec<u32>) = batch.iter().copied().unzip();
        let n = center.len();
        let center = Tensor::from_vec(center, n, &device)?;
        let context = Tensor::from_vec(context, n, &device)?;
        let negatives = model.sample_negatives(n, rng)?;
        let (positive, negative) = model.forward(&center, &context, &negatives)?;
        Ok(Word2VecLoss::call(&positive, &negative)?)
    })
}

pub fn train_glove(
    dataset: &CooccurrenceDataset,
    model: &GloVe,
    config: &TrainConfig,
) -> Result<TrainReport, TrainError> {
    let device = model.device().clone();
    fit("glove", dataset, model, config, |batch, _| {
        let n = batch.len();
        let pairs = batch.iter().flat_map(|e| [e.row, e.col]).collect::<Vec<_>>();
        let counts = batch.iter().map(|e| e.count).collect::<Vec<_>>();
        let pairs = Tensor::from_vec(pairs, (n, 2), &device)?;
        let counts = Tensor::from_vec(counts, n, &device)?;
        let (weight, delta) = model.forward(&pairs, &counts)?;
        Ok(GloveLoss::call(&weight, &delta)?)
    })
}

/// Stacks `(inputs, targets)` windows into two `[batch, context_length]` tensors
fn lm_batch(
    batch: &[(Vec<u32>, Vec<u32>)],
    device: &candle_core::Device,
) -> Result<(Tensor, Tensor), TrainError> {
    let n = batch.len();
    let context_length = batch.first().map_or(0, |(x, _)| x.len());
    let inputs = batch.iter().flat_map(|(x, _)| x.iter().copied()).collect::<Vec<_>>();
    let targets = batch.iter().flat_map(|(_, y)| y.iter().copied()).collect::<Vec<_>>();
    Ok((
        Tensor::from_vec(inputs, (n, context_length), device)?,
        Tensor::from_vec(targets, (n, context_length), device)?,
    ))
}

pub fn train_language_model(
    dataset: &LanguageModelDataset,
    model: &TransformerLM,
    config: &TrainConfig,
) -> Result<TrainReport, TrainError> {
    let device = model.device();
    fit("lm", dataset, model, config, |batch, _| {
        let (inputs, targets) = lm_batch(batch, &device)?;
        let logits = model.forward(&inputs)?;
        Ok(CrossEntropyLoss::call(&logits, &targets)?)
    })
}

/// Mean per-token cross entropy of `model` over `dataset`, without updating anything
pub fn evaluate_language_model(
    dataset: &LanguageModelDataset,
    model: &TransformerLM,
    batch_size: usize,
) -> Result<f32, TrainError> {
    let device = model.device();
    let loader = DataLoader::new(dataset, batch_size, false, false)?;
    let mut total = 0.0;
    let mut count = 0;
    for batch in loader.iter() {
        let (inputs, targets) = lm_batch(&batch, &device)?;
        let loss = CrossEntropyLoss::call(&model.forward(&inputs)?, &targets)?;
        total += loss.to_scalar::<f32>()? as f64 * batch.len() as f64;
        count += batch.len();
    }
    let mean = (total / count as f64) as f32;
    log::info!("Evaluation loss {mean:.4} (perplexity {:.2})", mean.exp());
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::{
        datasets::{Corpus, SkipGramOptions},
        tokenizer::CharTokenizer,
        transformer::TransformerConfig,
    };

    const TEXT: &str = "the cat sat on the mat\nthe dog sat on the log\na cat and a dog";

    fn quiet_config(batch_size: usize, epochs: usize, lr: f64) -> TrainConfig {
        TrainConfig {
            batch_size,
            epochs,
            lr,
            save_checkpoints: false,
            ..Default::default()
        }
    }

    fn mean(losses: &[f32]) -> f32 {
        losses.iter().sum::<f32>() / losses.len() as f32
    }

    #[test]
    fn test_train_skipgram_reduces_loss() {
        let corpus = Corpus::from_text(TEXT);
        let options = SkipGramOptions {
            window: 2,
            ..Default::default()
        };
        let dataset = SkipGramDataset::new(&corpus, &options).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = SkipGram::new(dataset.vocab().counts(), 8, 3, &Device::Cpu, &mut rng).unwrap();
        let config = quiet_config(dataset.len(), 100, 0.05);
        let report = train_skipgram(&dataset, &model, &config).unwrap();
        assert_eq!(report.step_losses.len(), 100);
        assert_eq!(report.epoch_losses.len(), 100);
        assert!(mean(&report.step_losses[90..]) < 0.9 * mean(&report.step_losses[..10]));
    }

    #[test]
    fn test_train_glove_reduces_loss() {
        let corpus = Corpus::from_text(TEXT);
        let dataset = CooccurrenceDataset::from_corpus(&corpus, 3, 1, None).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = GloVe::new(dataset.vocab().len(), 8, &Device::Cpu, &mut rng).unwrap();
        let config = quiet_config(dataset.len(), 50, 0.05);
        let report = train_glove(&dataset, &model, &config).unwrap();
        assert_eq!(report.step_losses.len(), 50);
        let first = report.step_losses[0];
        let last = *report.step_losses.last().unwrap();
        assert!(last < first);
        assert!(report.min_loss.unwrap() <= last);
        // one batch per epoch, so each epoch's minimum is its only loss
        assert_eq!(report.epoch_min_losses, report.epoch_losses);
    }

    #[test]
    fn test_train_language_model() {
        let text = "abcd".repeat(40);
        let tokenizer = CharTokenizer::build(&text);
        let dataset = LanguageModelDataset::new(tokenizer.encode(&text).unwrap(), 8).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = TransformerLM::new(
            TransformerConfig {
                vocab_size: tokenizer.vocab_size(),
                context_length: 8,
                d_model: 16,
                num_layers: 1,
                num_heads: 2,
                d_ff: 32,
                rope_theta: 10_000.0,
            },
            &Device::Cpu,
            &mut rng,
        )
        .unwrap();
        let before = evaluate_language_model(&dataset, &model, 4).unwrap();
        let config = TrainConfig {
            max_grad_norm: Some(1.0),
            ..quiet_config(dataset.len(), 30, 0.01)
        };
        let report = train_language_model(&dataset, &model, &config).unwrap();
        let after = evaluate_language_model(&dataset, &model, 4).unwrap();
        assert_eq!(report.epoch_losses.len(), 30);
        assert!(after < before);
    }

    #[test]
    fn test_checkpoints_written_each_epoch() {
        let corpus = Corpus::from_text(TEXT);
        let dataset = CooccurrenceDataset::from_corpus(&corpus, 2, 1, None).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = GloVe::new(dataset.vocab().len(), 4, &Device::Cpu, &mut rng).unwrap();
        let dir = std::env::temp_dir().join(format!("embed_rs_train_{}", std::process::id()));
        let config = TrainConfig {
            batch_size: 16,
            epochs: 2,
            output_dir: dir.clone(),
            ..Default::default()
        };
        train_glove(&dataset, &model, &config).unwrap();
        let mut names = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        std::fs::remove_dir_all(&dir).unwrap();
        names.sort();
        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|n| n.starts_with("glove_epoch-pre_loss-NA")));
        assert!(names.iter().any(|n| n.starts_with("glove_epoch-0_")));
        assert!(names.iter().any(|n| n.starts_with("glove_epoch-1_")));
    }

    #[test]
    fn test_zero_batch_size() {
        let corpus = Corpus::from_text(TEXT);
        let dataset = CooccurrenceDataset::from_corpus(&corpus, 2, 1, None).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = GloVe::new(dataset.vocab().len(), 4, &Device::Cpu, &mut rng).unwrap();
        let config = quiet_config(0, 1, 0.01);
        assert!(matches!(
            train_glove(&dataset, &model, &config),
            Err(TrainError::DataLoader(DataLoaderError::ZeroBatchSize))
        ));
    }
}
