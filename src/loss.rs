//! Loss function(s)

use candle_core::{D, Tensor};

use crate::{
    nn::NNError,
    ops::{cross_entropy, log_sigmoid},
};

/// Negative sampling objective of word2vec, averaged over the batch:
/// `-(log s(u_o . v_c) + sum_k log s(-u_k . v_c))`
pub struct Word2VecLoss;

impl Word2VecLoss {
    /// `positive` is `[batch]`, `negative` is `[batch, k]`
    pub fn call(positive: &Tensor, negative: &Tensor) -> Result<Tensor, NNError> {
        let pos = log_sigmoid(positive)?;
        let neg = log_sigmoid(&negative.neg()?)?.sum(D::Minus1)?;
        Ok((pos + neg)?.neg()?.mean_all()?)
    }
}

/// Weighted least squares of GloVe, `mean(f(X_ij) * delta_ij^2)`
pub struct GloveLoss;

impl GloveLoss {
    pub fn call(weight: &Tensor, delta: &Tensor) -> Result<Tensor, NNError> {
        Ok(weight.mul(&delta.sqr()?)?.mean_all()?)
    }
}

/// Mean next token cross entropy
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// `logits` is `[..., vocab]` and `targets` the matching `[...]` ids
    pub fn call(logits: &Tensor, targets: &Tensor) -> Result<Tensor, NNError> {
        let vocab = logits.dim(D::Minus1)?;
        let logits = logits.reshape(((), vocab))?;
        let targets = targets.flatten_all()?;
        if logits.dim(0)? != targets.dim(0)? {
            return Err(NNError::InputSizeMismatch {
                expected: logits.dim(0)?,
                got: targets.dim(0)?,
            });
        }
        Ok(cross_entropy(&logits, &targets)?)
    }
}
