//! Skip-gram word2vec with negative sampling

use candle_core::{DType, Device, Tensor, Var};
use rand::Rng;
use rand::distr::{Distribution, weighted::WeightedIndex};

use crate::nn::{Embedding, Module, NNError, Parameters, prefixed, uniform};

/// Draws negative words from the unigram distribution raised to the 3/4 power
pub struct NegativeSampler {
    dist: WeightedIndex<f64>,
}

impl NegativeSampler {
    pub fn new(counts: &[u64]) -> Result<Self, NNError> {
        let weights = counts.iter().map(|&c| (c as f64).powf(0.75));
        let dist = WeightedIndex::new(weights).map_err(|e| {
            NNError::InvalidConfig(format!("cannot build negative sampling table: {e}"))
        })?;
        Ok(Self { dist })
    }

    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<u32> {
        (0..n).map(|_| self.dist.sample(rng) as u32).collect()
    }
}

pub struct SkipGram {
    /// center word vectors, `V`
    center: Embedding,
    /// context (outside) word vectors, `U`
    context: Embedding,
    sampler: NegativeSampler,
    neg_samples: usize,
}

impl SkipGram {
    /// `counts` are the unigram counts of the vocabulary, indexed by word id
    pub fn new<R: Rng + ?Sized>(
        counts: &[u64],
        embedding_dim: usize,
        neg_samples: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        let vocab_size = counts.len();
        if embedding_dim == 0 || neg_samples == 0 {
            return Err(NNError::InvalidConfig(
                "embedding_dim and neg_samples must be positive".to_string(),
            ));
        }
        let bound = 0.5 / embedding_dim as f32;
        let center = Tensor::from_vec(
            uniform(vocab_size * embedding_dim, bound, rng),
            (vocab_size, embedding_dim),
            device,
        )?;
        let context = Tensor::zeros((vocab_size, embedding_dim), DType::F32, device)?;
        Ok(Self {
            center: Embedding::from_weight(center)?,
            context: Embedding::from_weight(context)?,
            sampler: NegativeSampler::new(counts)?,
            neg_samples,
        })
    }

    pub fn device(&self) -> &Device {
        self.center.weight().device()
    }

    pub fn neg_samples(&self) -> usize {
        self.neg_samples
    }

    /// Negative word ids for a batch, shaped `[batch, neg_samples]`
    pub fn sample_negatives<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Tensor, NNError> {
        let ids = self.sampler.sample(batch_size * self.neg_samples, rng);
        Ok(Tensor::from_vec(
            ids,
            (batch_size, self.neg_samples),
            self.device(),
        )?)
    }

    /// Scores of the observed pairs `[batch]` and of the negative pairs `[batch, k]`.
    ///
    /// `center` and `context` are `[batch]` word ids, `negatives` is `[batch, k]`.
    pub fn forward(
        &self,
        center: &Tensor,
        context: &Tensor,
        negatives: &Tensor,
    ) -> Result<(Tensor, Tensor), NNError> {
        let v = self.center.forward(center)?;
        let u = self.context.forward(context)?;
        let positive = v.mul(&u)?.sum(1)?;
        let u_neg = self.context.forward(negatives)?;
        let negative = u_neg.matmul(&v.unsqueeze(2)?)?.squeeze(2)?;
        Ok((positive, negative))
    }

    /// The learned center vectors, `[vocab, dim]`
    pub fn word_vectors(&self) -> &Tensor {
        self.center.weight()
    }
}

impl Parameters for SkipGram {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = prefixed("center", &self.center);
        params.extend(prefixed("context", &self.context));
        params
    }
}
