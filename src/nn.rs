//! Components to build a neural network
//!
//! Layers own their weights as candle [`Var`]s so the autograd engine tracks them, and expose
//! them by name through [`Parameters`] for optimizers and checkpoints.

use candle_core::{D, DType, Device, Tensor, Var};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::ops::{causal_mask, scaled_dot_product_attention, silu};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Sequence length {got} exceeds the maximum of {max}")]
    SequenceTooLong { max: usize, got: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Anything that owns trainable parameters.
/// Analogous to `torch.nn.Module.named_parameters`
pub trait Parameters {
    /// Parameters with stable, dot separated names used as checkpoint keys
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn parameters(&self) -> Vec<Var> {
        self.named_parameters()
            .into_iter()
            .map(|(_, var)| var)
            .collect()
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|v| v.elem_count()).sum()
    }
}

/// Represents the torch.nn.Module. Single input layers should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module: Parameters {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, NNError>;
}

/// Prepends `prefix.` to every parameter name of a sub-module
pub(crate) fn prefixed<P: Parameters + ?Sized>(prefix: &str, module: &P) -> Vec<(String, Var)> {
    module
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (format!("{prefix}.{name}"), var))
        .collect()
}

/// Samples `n` values from `N(0, std^2)` truncated to `[-3 std, 3 std]`
pub fn trunc_normal<R: Rng + ?Sized>(n: usize, std: f32, rng: &mut R) -> Result<Vec<f32>, NNError> {
    let normal = Normal::new(0.0, std).map_err(|e| NNError::InvalidConfig(e.to_string()))?;
    let bound = 3.0 * std;
    Ok((0..n)
        .map(|_| loop {
            let x = normal.sample(rng);
            if x.abs() <= bound {
                break x;
            }
        })
        .collect())
}

/// Samples `n` values uniformly from `[-bound, bound)`
pub fn uniform<R: Rng + ?Sized>(n: usize, bound: f32, rng: &mut R) -> Vec<f32> {
    if bound <= 0.0 {
        return vec![0.0; n];
    }
    (0..n).map(|_| rng.random_range(-bound..bound)).collect()
}

/// Linear transformation without bias, `y = x W^T`
pub struct Linear {
    /// `[out_features, in_features]`
    weight: Var,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        let std = 2.0 / (in_features + out_features) as f32;
        let data = trunc_normal(in_features * out_features, std, rng)?;
        Self::from_weight(Tensor::from_vec(data, (out_features, in_features), device)?)
    }

    /// `weight` is `[out_features, in_features]`, both non-zero
    pub fn from_weight(weight: Tensor) -> Result<Self, NNError> {
        let (out_features, in_features) = weight.dims2()?;
        if out_features == 0 || in_features == 0 {
            return Err(NNError::InvalidConfig(format!(
                "linear layer needs non-zero dimensions, got [{out_features}, {in_features}]"
            )));
        }
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Parameters for Linear {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }
}

impl Module for Linear {
    /// Maps `[..., in_features]` to `[..., out_features]`
    fn forward(&self, xs: &Tensor) -> Result<Tensor, NNError> {
        let mut dims = xs.dims().to_vec();
        let d_in = dims.last().copied().unwrap_or(0);
        if d_in != self.in_features() {
            return Err(NNError::InputSizeMismatch {
                expected: self.in_features(),
                got: d_in,
            });
        }
        let rows = xs.elem_count() / d_in;
        let ys = xs.reshape((rows, d_in))?.matmul(&self.weight.t()?)?;
        if let Some(last) = dims.last_mut() {
            *last = self.out_features();
        }
        Ok(ys.reshape(dims)?)
    }
}

/// Lookup table from token ids to dense vectors
pub struct Embedding {
    /// `[num_embeddings, embedding_dim]`
    weight: Var,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(
        num_embeddings: usize,
        embedding_dim: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        let data = trunc_normal(num_embeddings * embedding_dim, 1.0, rng)?;
        Self::from_weight(Tensor::from_vec(data, (num_embeddings, embedding_dim), device)?)
    }

    pub fn from_weight(weight: Tensor) -> Result<Self, NNError> {
        weight.dims2()?;
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }
}

impl Parameters for Embedding {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }
}

impl Module for Embedding {
    /// Maps integer ids of any shape `[...]` to `[..., embedding_dim]`
    fn forward(&self, ids: &Tensor) -> Result<Tensor, NNError> {
        let mut dims = ids.dims().to_vec();
        // index_select only has a backward pass for contiguous ids
        let flat = ids.flatten_all()?.contiguous()?;
        let rows = self.weight.index_select(&flat, 0)?;
        dims.push(self.embedding_dim());
        Ok(rows.reshape(dims)?)
    }
}

/// Root mean square layer normalization with a learned gain
pub struct RMSNorm {
    weight: Var,
    eps: f64,
}

impl RMSNorm {
    pub fn new(d_model: usize, device: &Device) -> Result<Self, NNError> {
        Ok(Self {
            weight: Var::ones(d_model, DType::F32, device)?,
            eps: 1e-5,
        })
    }
}

impl Parameters for RMSNorm {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }
}

impl Module for RMSNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, NNError> {
        let d_model = self.weight.elem_count();
        let got = xs.dim(D::Minus1)?;
        if got != d_model {
            return Err(NNError::InputSizeMismatch {
                expected: d_model,
                got,
            });
        }
        let rms = (xs.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        Ok(xs.broadcast_div(&rms)?.broadcast_mul(&self.weight)?)
    }
}

/// Position-wise feed forward network with a SwiGLU gate, `W2(SiLU(W1 x) * W3 x)`
pub struct SwiGLUFFN {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl SwiGLUFFN {
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        d_hidden: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        Ok(Self {
            w1: Linear::new(d_model, d_hidden, device, rng)?,
            w2: Linear::new(d_hidden, d_model, device, rng)?,
            w3: Linear::new(d_model, d_hidden, device, rng)?,
        })
    }
}

impl Parameters for SwiGLUFFN {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = prefixed("w1", &self.w1);
        params.extend(prefixed("w2", &self.w2));
        params.extend(prefixed("w3", &self.w3));
        params
    }
}

impl Module for SwiGLUFFN {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, NNError> {
        let gate = silu(&self.w1.forward(xs)?)?;
        let hidden = gate.mul(&self.w3.forward(xs)?)?;
        self.w2.forward(&hidden)
    }
}

/// Rotary position embedding over adjacent pairs `(x_2k, x_2k+1)`.
/// Holds no trainable parameters, only the cos/sin tables.
pub struct RotaryEmbedding {
    /// `[max_seq_len, d_k / 2]`
    cos: Tensor,
    sin: Tensor,
    d_k: usize,
}

impl RotaryEmbedding {
    pub fn new(theta: f64, d_k: usize, max_seq_len: usize, device: &Device) -> Result<Self, NNError> {
        if d_k % 2 != 0 {
            return Err(NNError::InvalidConfig(format!(
                "rotary embedding needs an even head dimension, got {d_k}"
            )));
        }
        let half = d_k / 2;
        let angles = (0..max_seq_len)
            .flat_map(|pos| {
                (0..half).map(move |k| pos as f64 / theta.powf((2 * k) as f64 / d_k as f64))
            })
            .collect::<Vec<_>>();
        let cos = angles.iter().map(|a| a.cos() as f32).collect::<Vec<_>>();
        let sin = angles.iter().map(|a| a.sin() as f32).collect::<Vec<_>>();
        Ok(Self {
            cos: Tensor::from_vec(cos, (max_seq_len, half), device)?,
            sin: Tensor::from_vec(sin, (max_seq_len, half), device)?,
            d_k,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rotates `xs` of shape `[..., t, d_k]` by the angles of `positions` (`u32`, shape `[t]`)
    pub fn forward(&self, xs: &Tensor, positions: &Tensor) -> Result<Tensor, NNError> {
        let dims = xs.dims().to_vec();
        let got = xs.dim(D::Minus1)?;
        if got != self.d_k {
            return Err(NNError::InputSizeMismatch {
                expected: self.d_k,
                got,
            });
        }
        let cos = self.cos.index_select(positions, 0)?;
        let sin = self.sin.index_select(positions, 0)?;

        let mut pair_dims = dims[..dims.len() - 1].to_vec();
        pair_dims.extend([self.d_k / 2, 2]);
        let pairs = xs.reshape(pair_dims)?;
        let even = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
        let odd = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;
        let rot_even = (even.broadcast_mul(&cos)? - odd.broadcast_mul(&sin)?)?;
        let rot_odd = (even.broadcast_mul(&sin)? + odd.broadcast_mul(&cos)?)?;
        Ok(Tensor::stack(&[&rot_even, &rot_odd], D::Minus1)?.reshape(dims)?)
    }
}

/// Causal multi-head self attention with rotary position embeddings on queries and keys
pub struct MultiHeadSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    output_proj: Linear,
    num_heads: usize,
    rope: RotaryEmbedding,
}

impl MultiHeadSelfAttention {
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        num_heads: usize,
        theta: f64,
        context_length: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(NNError::InvalidConfig(format!(
                "d_model ({d_model}) must be divisible by num_heads ({num_heads})"
            )));
        }
        Ok(Self {
            q_proj: Linear::new(d_model, d_model, device, rng)?,
            k_proj: Linear::new(d_model, d_model, device, rng)?,
            v_proj: Linear::new(d_model, d_model, device, rng)?,
            output_proj: Linear::new(d_model, d_model, device, rng)?,
            num_heads,
            rope: RotaryEmbedding::new(theta, d_model / num_heads, context_length, device)?,
        })
    }
}

impl Parameters for MultiHeadSelfAttention {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = prefixed("q_proj", &self.q_proj);
        params.extend(prefixed("k_proj", &self.k_proj));
        params.extend(prefixed("v_proj", &self.v_proj));
        params.extend(prefixed("output_proj", &self.output_proj));
        params
    }
}

impl Module for MultiHeadSelfAttention {
    /// `[batch, seq, d_model]` to `[batch, seq, d_model]`, position `i` only sees positions `<= i`
    fn forward(&self, xs: &Tensor) -> Result<Tensor, NNError> {
        let (b, t, d_model) = xs.dims3()?;
        let max = self.rope.max_seq_len();
        if t > max {
            return Err(NNError::SequenceTooLong { max, got: t });
        }
        let d_k = d_model / self.num_heads;
        let heads = |x: Tensor| -> candle_core::Result<Tensor> {
            x.reshape((b, t, self.num_heads, d_k))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.q_proj.forward(xs)?)?;
        let k = heads(self.k_proj.forward(xs)?)?;
        let v = heads(self.v_proj.forward(xs)?)?;

        let positions = Tensor::arange(0u32, t as u32, xs.device())?;
        let q = self.rope.forward(&q, &positions)?;
        let k = self.rope.forward(&k, &positions)?;

        let mask = causal_mask(t, xs.device())?;
        let attn = scaled_dot_product_attention(&q, &k, &v, Some(&mask))?;
        let attn = attn.transpose(1, 2)?.reshape((b, t, d_model))?;
        self.output_proj.forward(&attn)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_close;

    #[test]
    fn test_linear_forward() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 2.0], [3.0, 4.0], [1.0, 1.0]], &device).unwrap();
        let linear = Linear::from_weight(weight).unwrap();
        let xs = Tensor::new(&[[[1f32, 1.0], [2.0, 0.0]]], &device).unwrap();
        let ys = linear.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 2, 3]);
        assert_eq!(
            ys.to_vec3::<f32>().unwrap(),
            vec![vec![vec![3.0, 7.0, 2.0], vec![2.0, 6.0, 2.0]]]
        );
        assert_eq!(linear.num_parameters(), 6);
    }

    #[test]
    fn test_dim_mismatch() {
        let linear = Linear::from_weight(Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let xs = Tensor::ones((4, 5), DType::F32, &Device::Cpu).unwrap();
        let err = linear.forward(&xs).unwrap_err();
        assert!(matches!(
            err,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 5
            }
        ));
    }

    #[test]
    fn test_trunc_normal_bounds() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let values = trunc_normal(10_000, 0.5, &mut rng).unwrap();
        assert!(values.iter().all(|v| v.abs() <= 1.5));
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05);
    }

    #[test]
    fn test_embedding_lookup() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[0f32, 0.0], [1.0, 1.0], [2.0, 2.0]], &device).unwrap();
        let embedding = Embedding::from_weight(weight).unwrap();
        let ids = Tensor::new(&[[2u32, 0], [1, 1]], &device).unwrap();
        let out = embedding.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[2, 2, 2]);
        assert_eq!(
            out.to_vec3::<f32>().unwrap(),
            vec![
                vec![vec![2.0, 2.0], vec![0.0, 0.0]],
                vec![vec![1.0, 1.0], vec![1.0, 1.0]]
            ]
        );
    }

    #[test]
    fn test_linear_rejects_zero_dims() {
        let weight = Tensor::zeros((3, 0), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            Linear::from_weight(weight),
            Err(NNError::InvalidConfig(_))
        ));
        let weight = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(Linear::from_weight(weight).is_err());
    }

    #[test]
    fn test_embedding_backward_strided_ids() {
        let device = Device::Cpu;
        let embedding =
            Embedding::from_weight(Tensor::ones((3, 2), DType::F32, &device).unwrap()).unwrap();
        // first column of a [2, 2] id tensor is a strided view
        let ids = Tensor::new(&[[2u32, 1], [0, 1]], &device)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .squeeze(1)
            .unwrap();
        let loss = embedding.forward(&ids).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(embedding.weight()).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(grad, vec![vec![1.0, 1.0], vec![0.0, 0.0], vec![1.0, 1.0]]);
    }

    #[test]
    fn test_rms_norm() {
        let norm = RMSNorm::new(2, &Device::Cpu).unwrap();
        let xs = Tensor::new(&[[3f32, 4.0]], &Device::Cpu).unwrap();
        let out = norm.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        let rms = (12.5f32 + 1e-5).sqrt();
        assert_close!(out[0][0], 3.0 / rms);
        assert_close!(out[0][1], 4.0 / rms);
    }

    #[test]
    fn test_swiglu_shape_and_names() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let ffn = SwiGLUFFN::new(4, 8, &Device::Cpu, &mut rng).unwrap();
        let xs = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(ffn.forward(&xs).unwrap().dims(), &[2, 3, 4]);
        let names = ffn
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["w1.weight", "w2.weight", "w3.weight"]);
        assert_eq!(ffn.num_parameters(), 3 * 32);
    }

    #[test]
    fn test_rope() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(10000.0, 2, 4, &device).unwrap();
        let xs = Tensor::new(&[[1f32, 0.0], [1.0, 0.0]], &device).unwrap();
        let positions = Tensor::new(&[0u32, 1], &device).unwrap();
        let out = rope.forward(&xs, &positions).unwrap().to_vec2::<f32>().unwrap();
        // position 0 is left untouched, position 1 rotates by one radian
        assert_close!(out[0][0], 1.0);
        assert_close!(out[0][1], 0.0);
        assert_close!(out[1][0], 1f32.cos());
        assert_close!(out[1][1], 1f32.sin());

        assert!(matches!(
            RotaryEmbedding::new(10000.0, 3, 4, &device),
            Err(NNError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_attention_is_causal() {
        let device = Device::Cpu;
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let attn = MultiHeadSelfAttention::new(8, 2, 10000.0, 16, &device, &mut rng).unwrap();
        let data = trunc_normal(4 * 8, 1.0, &mut rng).unwrap();
        let xs = Tensor::from_vec(data.clone(), (1, 4, 8), &device).unwrap();
        let mut changed = data;
        for v in changed[8..].iter_mut() {
            *v += 1.0;
        }
        let xs_changed = Tensor::from_vec(changed, (1, 4, 8), &device).unwrap();

        let out = attn.forward(&xs).unwrap();
        let out_changed = attn.forward(&xs_changed).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8]);
        // only the later tokens changed, so the first position sees the same inputs
        let first = out.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let first_changed = out_changed
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (a, b) in first.iter().zip(first_changed.iter()) {
            assert_close!(*a, *b);
        }
        let last = out.narrow(1, 3, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let last_changed = out_changed
            .narrow(1, 3, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(last.iter().zip(last_changed.iter()).any(|(a, b)| (a - b).abs() > 1e-6));
    }

    #[test]
    fn test_attention_errors() {
        let device = Device::Cpu;
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        assert!(matches!(
            MultiHeadSelfAttention::new(10, 3, 10000.0, 8, &device, &mut rng),
            Err(NNError::InvalidConfig(_))
        ));
        let attn = MultiHeadSelfAttention::new(4, 2, 10000.0, 2, &device, &mut rng).unwrap();
        let xs = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            attn.forward(&xs),
            Err(NNError::SequenceTooLong { max: 2, got: 3 })
        ));
    }
}
