//! Decoder-only transformer language model

use candle_core::{D, Device, Tensor, Var};
use rand::Rng;
use rand::distr::{Distribution, weighted::WeightedIndex};

use crate::{
    nn::{
        Embedding, Linear, Module, MultiHeadSelfAttention, NNError, Parameters, RMSNorm,
        SwiGLUFFN, prefixed,
    },
    ops::softmax,
};

/// Hyper-parameters of [`TransformerLM`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerConfig {
    pub vocab_size: usize,
    /// Longest sequence the model can attend over
    pub context_length: usize,
    pub d_model: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Inner dimension of the feed forward layers
    pub d_ff: usize,
    pub rope_theta: f64,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10_000,
            context_length: 256,
            d_model: 512,
            num_layers: 6,
            num_heads: 16,
            d_ff: 1344,
            rope_theta: 10_000.0,
        }
    }
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<(), NNError> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
            ("d_model", self.d_model),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("d_ff", self.d_ff),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(NNError::InvalidConfig(format!("{name} must be positive")));
        }
        if self.d_model % self.num_heads != 0 {
            return Err(NNError::InvalidConfig(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        if (self.d_model / self.num_heads) % 2 != 0 {
            return Err(NNError::InvalidConfig(format!(
                "head dimension {} must be even for rotary embeddings",
                self.d_model / self.num_heads
            )));
        }
        if self.rope_theta <= 0.0 {
            return Err(NNError::InvalidConfig("rope_theta must be positive".to_string()));
        }
        Ok(())
    }
}

/// Pre-norm transformer block
pub struct TransformerBlock {
    ln1: RMSNorm,
    attn: MultiHeadSelfAttention,
    ln2: RMSNorm,
    ffn: SwiGLUFFN,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(
        config: &TransformerConfig,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        Ok(Self {
            ln1: RMSNorm::new(config.d_model, device)?,
            attn: MultiHeadSelfAttention::new(
                config.d_model,
                config.num_heads,
                config.rope_theta,
                config.context_length,
                device,
                rng,
            )?,
            ln2: RMSNorm::new(config.d_model, device)?,
            ffn: SwiGLUFFN::new(config.d_model, config.d_ff, device, rng)?,
        })
    }
}

impl Parameters for TransformerBlock {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = prefixed("ln1", &self.ln1);
        params.extend(prefixed("attn", &self.attn));
        params.extend(prefixed("ln2", &self.ln2));
        params.extend(prefixed("ffn", &self.ffn));
        params
    }
}

impl Module for TransformerBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, NNError> {
        let ys = (xs + self.attn.forward(&self.ln1.forward(xs)?)?)?;
        Ok((&ys + self.ffn.forward(&self.ln2.forward(&ys)?)?)?)
    }
}

pub struct TransformerLM {
    token_embeddings: Embedding,
    layers: Vec<TransformerBlock>,
    ln_final: RMSNorm,
    lm_head: Linear,
    config: TransformerConfig,
}

impl TransformerLM {
    pub fn new<R: Rng + ?Sized>(
        config: TransformerConfig,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        config.validate()?;
        let token_embeddings = Embedding::new(config.vocab_size, config.d_model, device, rng)?;
        let layers = (0..config.num_layers)
            .map(|_| TransformerBlock::new(&config, device, rng))
            .collect::<Result<Vec<_>, _>>()?;
        let model = Self {
            token_embeddings,
            layers,
            ln_final: RMSNorm::new(config.d_model, device)?,
            lm_head: Linear::new(config.d_model, config.vocab_size, device, rng)?,
            config,
        };
        log::info!(
            "Initialized transformer LM with {} parameters",
            model.num_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Next token probabilities `[batch, seq, vocab]` at temperature `tau`
    pub fn forward_probs(&self, token_ids: &Tensor, tau: f64) -> Result<Tensor, NNError> {
        Ok(softmax(&self.forward(token_ids)?, D::Minus1, tau)?)
    }

    /// Samples up to `max_new_tokens` continuations of `prompt`.
    ///
    /// The model only ever sees the last `context_length` tokens. With `top_p` set, sampling is
    /// restricted to the smallest set of tokens whose probability mass reaches `top_p`.
    /// Generation stops early once `eos` is produced; the returned ids exclude the prompt.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        tau: f64,
        top_p: Option<f64>,
        eos: Option<u32>,
        rng: &mut R,
    ) -> Result<Vec<u32>, NNError> {
        if prompt.is_empty() {
            return Err(NNError::InvalidConfig(
                "generation needs a non-empty prompt".to_string(),
            ));
        }
        let device = self.device();
        let mut tokens = prompt.to_vec();
        let mut generated = Vec::with_capacity(max_new_tokens);
        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(self.config.context_length);
            let window = &tokens[start..];
            let ids = Tensor::new(window, &device)?.unsqueeze(0)?;
            let probs = self
                .forward_probs(&ids, tau)?
                .squeeze(0)?
                .get(window.len() - 1)?
                .to_vec1::<f32>()?;
            let next = sample_token(&probs, top_p, rng)?;
            tokens.push(next);
            generated.push(next);
            if Some(next) == eos {
                break;
            }
        }
        Ok(generated)
    }

    pub fn device(&self) -> Device {
        self.token_embeddings.weight().device().clone()
    }
}

/// Draws one token id from `probs`, optionally keeping only the top-p nucleus
fn sample_token<R: Rng + ?Sized>(
    probs: &[f32],
    top_p: Option<f64>,
    rng: &mut R,
) -> Result<u32, NNError> {
    let mut ranked = probs.iter().copied().enumerate().collect::<Vec<_>>();
    if let Some(p) = top_p {
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut mass = 0f64;
        let keep = ranked
            .iter()
            .position(|(_, prob)| {
                mass += *prob as f64;
                mass >= p
            })
            .map_or(ranked.len(), |i| i + 1);
        ranked.truncate(keep);
    }
    let dist = WeightedIndex::new(ranked.iter().map(|(_, prob)| *prob))
        .map_err(|e| NNError::InvalidConfig(format!("cannot sample from distribution: {e}")))?;
    Ok(ranked[dist.sample(rng)].0 as u32)
}

impl Parameters for TransformerLM {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = prefixed("token_embeddings", &self.token_embeddings);
        for (i, layer) in self.layers.iter().enumerate() {
            params.extend(prefixed(&format!("layers.{i}"), layer));
        }
        params.extend(prefixed("ln_final", &self.ln_final));
        params.extend(prefixed("lm_head", &self.lm_head));
        params
    }
}

impl Module for TransformerLM {
    /// Token ids `[batch, seq]` to logits `[batch, seq, vocab]`
    fn forward(&self, token_ids: &Tensor) -> Result<Tensor, NNError> {
        let mut xs = self.token_embeddings.forward(token_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        self.lm_head.forward(&self.ln_final.forward(&xs)?)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_close;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 11,
            context_length: 8,
            d_model: 16,
            num_layers: 2,
            num_heads: 2,
            d_ff: 32,
            rope_theta: 10_000.0,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(tiny_config().validate().is_ok());
        let config = TransformerConfig {
            num_heads: 3,
            ..tiny_config()
        };
        assert!(matches!(config.validate(), Err(NNError::InvalidConfig(_))));
        let config = TransformerConfig {
            vocab_size: 0,
            ..tiny_config()
        };
        assert!(matches!(config.validate(), Err(NNError::InvalidConfig(_))));
        // head dimension 16 / 16 = 1 is odd
        let config = TransformerConfig {
            num_heads: 16,
            ..tiny_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = TransformerLM::new(tiny_config(), &Device::Cpu, &mut rng).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 11]);

        let probs = model.forward_probs(&ids, 0.7).unwrap();
        let sums = probs.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert_close!(s, 1.0);
        }
    }

    #[test]
    fn test_parameter_names() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = TransformerLM::new(tiny_config(), &Device::Cpu, &mut rng).unwrap();
        let names = model
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect::<Vec<_>>();
        assert_eq!(names.first().map(String::as_str), Some("token_embeddings.weight"));
        assert!(names.contains(&"layers.1.attn.q_proj.weight".to_string()));
        assert!(names.contains(&"layers.0.ffn.w3.weight".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("lm_head.weight"));
        // embeddings + 2 * (2 norms + 4 attn + 3 ffn) + final norm + head
        assert_eq!(names.len(), 1 + 2 * 9 + 2);
    }

    #[test]
    fn test_generate() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let model = TransformerLM::new(tiny_config(), &Device::Cpu, &mut rng).unwrap();
        // longer than the context window on purpose
        let out = model
            .generate(&[1; 12], 5, 1.0, Some(0.9), None, &mut rng)
            .unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|&id| id < 11));

        assert!(model.generate(&[], 5, 1.0, None, None, &mut rng).is_err());
    }

    #[test]
    fn test_generate_stops_at_eos() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let model = TransformerLM::new(tiny_config(), &Device::Cpu, &mut rng).unwrap();
        // a tiny nucleus keeps only the most likely token, so decoding is greedy
        let greedy = Some(1e-9);
        let full = model.generate(&[2, 3], 6, 1.0, greedy, None, &mut rng).unwrap();
        assert_eq!(full.len(), 6);

        let eos = full[0];
        let stopped = model
            .generate(&[2, 3], 6, 1.0, greedy, Some(eos), &mut rng)
            .unwrap();
        assert_eq!(stopped, vec![eos]);

        let eos = full[2];
        let stopped = model
            .generate(&[2, 3], 6, 1.0, greedy, Some(eos), &mut rng)
            .unwrap();
        let first_eos = full.iter().position(|&t| t == eos).unwrap();
        assert_eq!(stopped, full[..=first_eos].to_vec());
    }

    #[test]
    fn test_sample_token_top_p() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let probs = [0.05f32, 0.9, 0.05];
        // the nucleus at 0.5 only contains the most likely token
        for _ in 0..20 {
            assert_eq!(sample_token(&probs, Some(0.5), &mut rng).unwrap(), 1);
        }
        let all_zero = [0f32, 0.0];
        assert!(sample_token(&all_zero, None, &mut rng).is_err());
    }
}
