//! GloVe: global vectors from weighted least squares on log co-occurrence counts

use candle_core::{Device, Tensor, Var};
use rand::Rng;

use crate::nn::{Embedding, Module, NNError, Parameters, prefixed, uniform};

pub struct GloVe {
    words: Embedding,
    contexts: Embedding,
    word_biases: Embedding,
    context_biases: Embedding,
    x_max: f64,
    alpha: f64,
}

impl GloVe {
    pub fn new<R: Rng + ?Sized>(
        vocab_size: usize,
        embedding_dim: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if embedding_dim == 0 {
            return Err(NNError::InvalidConfig(
                "embedding_dim must be positive".to_string(),
            ));
        }
        let bound = 0.5 / embedding_dim as f32;
        let mut table = |dim: usize| -> Result<Embedding, NNError> {
            let data = uniform(vocab_size * dim, bound, rng);
            Embedding::from_weight(Tensor::from_vec(data, (vocab_size, dim), device)?)
        };
        Ok(Self {
            words: table(embedding_dim)?,
            contexts: table(embedding_dim)?,
            word_biases: table(1)?,
            context_biases: table(1)?,
            x_max: 100.0,
            alpha: 0.75,
        })
    }

    pub fn device(&self) -> &Device {
        self.words.weight().device()
    }

    /// Overrides the weighting function cutoff and exponent (defaults 100 and 0.75)
    pub fn with_weighting(mut self, x_max: f64, alpha: f64) -> Self {
        self.x_max = x_max;
        self.alpha = alpha;
        self
    }

    /// `f(X) = min(1, (X / x_max)^alpha)`
    pub fn weighting(&self, counts: &Tensor) -> Result<Tensor, NNError> {
        Ok((counts / self.x_max)?.powf(self.alpha)?.minimum(1f32)?)
    }

    /// Weights `f(X_ij)` and residuals `w_i . w~_j + b_i + b~_j - log X_ij`, both `[batch]`.
    ///
    /// `pairs` holds `(i, j)` ids as `[batch, 2]`, `counts` the matching `X_ij` as `[batch]`.
    pub fn forward(&self, pairs: &Tensor, counts: &Tensor) -> Result<(Tensor, Tensor), NNError> {
        let rows = pairs.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let cols = pairs.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;
        let dot = self
            .words
            .forward(&rows)?
            .mul(&self.contexts.forward(&cols)?)?
            .sum(1)?;
        let biases = (self.word_biases.forward(&rows)?.squeeze(1)?
            + self.context_biases.forward(&cols)?.squeeze(1)?)?;
        let delta = ((dot + biases)? - counts.log()?)?;
        Ok((self.weighting(counts)?, delta))
    }

    /// `W + W~`, the usual final GloVe vectors, `[vocab, dim]`
    pub fn word_vectors(&self) -> Result<Tensor, NNError> {
        Ok((self.words.weight() + self.contexts.weight())?)
    }
}

impl Parameters for GloVe {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = prefixed("words", &self.words);
        params.extend(prefixed("contexts", &self.contexts));
        params.extend(prefixed("word_biases", &self.word_biases));
        params.extend(prefixed("context_biases", &self.context_biases));
        params
    }
}
