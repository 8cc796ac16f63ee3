//! Saving and restoring model parameters as safetensors files

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use candle_core::Tensor;
use thiserror::Error;

use crate::nn::Parameters;

/// Errors for checkpoint files
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint has no tensor named '{0}'")]
    MissingTensor(String),
    #[error("Tensor '{name}' has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// File name encoding the run settings, e.g. `glove_epoch-3_loss-0.125_lr-0.001_bs-400.safetensors`.
///
/// `epoch` is `None` for the snapshot taken before training and `loss` is `None` when no loss
/// has been measured yet.
pub fn checkpoint_name(
    model: &str,
    epoch: Option<usize>,
    loss: Option<f32>,
    lr: f64,
    batch_size: usize,
) -> String {
    let epoch = epoch.map_or_else(|| "pre".to_string(), |e| e.to_string());
    // `{:?}` keeps the fractional part of whole numbers, `2.0` rather than `2`
    let loss = loss.map_or_else(|| "NA".to_string(), |l| format!("{:?}", (l * 1000.0).round() / 1000.0));
    format!("{model}_epoch-{epoch}_loss-{loss}_lr-{lr}_bs-{batch_size}.safetensors")
}

/// Writes every named parameter of `model` into `dir/name`
pub fn save_checkpoint<M: Parameters + ?Sized>(
    model: &M,
    dir: &Path,
    name: &str,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let tensors = model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect::<HashMap<String, Tensor>>();
    candle_core::safetensors::save(&tensors, &path)?;
    log::info!("Saved checkpoint '{}'", path.display());
    Ok(path)
}

/// Copies the tensors stored at `path` into the parameters of `model`.
/// Every parameter must be present with a matching shape; extra tensors are ignored.
pub fn load_checkpoint<M: Parameters + ?Sized>(model: &M, path: &Path) -> Result<(), CheckpointError> {
    let params = model.named_parameters();
    let Some((_, first)) = params.first() else {
        return Ok(());
    };
    let tensors = candle_core::safetensors::load(path, first.device())?;
    for (name, var) in &params {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| CheckpointError::MissingTensor(name.clone()))?;
        if tensor.dims() != var.dims() {
            return Err(CheckpointError::ShapeMismatch {
                name: name.clone(),
                expected: var.dims().to_vec(),
                found: tensor.dims().to_vec(),
            });
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    log::info!("Loaded checkpoint '{}'", path.display());
    Ok(())
}
