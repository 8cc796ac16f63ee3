//! Differentiable functions composed from tensor primitives
//!
//! Everything here is built from candle ops that carry a backward pass, so gradients flow
//! through these functions without any extra bookkeeping.

use candle_core::{D, DType, Device, Result, Tensor, shape::Dim};

/// Softmax with temperature `tau` along `dim`.
///
/// The maximum is subtracted first so large logits cannot overflow `exp`.
pub fn softmax<Dm: Dim>(xs: &Tensor, dim: Dm, tau: f64) -> Result<Tensor> {
    if tau <= 0.0 {
        candle_core::bail!("softmax temperature must be positive, got {tau}")
    }
    let dim = dim.to_index(xs.shape(), "softmax")?;
    let xs = (xs / tau)?;
    let max = xs.max_keepdim(dim)?;
    let exp = xs.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(dim)?;
    exp.broadcast_div(&sum)
}

pub fn log_softmax<Dm: Dim>(xs: &Tensor, dim: Dm) -> Result<Tensor> {
    let dim = dim.to_index(xs.shape(), "log_softmax")?;
    let max = xs.max_keepdim(dim)?;
    let shifted = xs.broadcast_sub(&max)?;
    let log_sum = shifted.exp()?.sum_keepdim(dim)?.log()?;
    shifted.broadcast_sub(&log_sum)
}

pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    (xs.neg()?.exp()? + 1.0)?.recip()
}

/// `log(sigmoid(x))` computed as `min(x, 0) - log(1 + exp(-|x|))`
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    let soft = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    xs.minimum(0f32)?.sub(&soft)
}

/// SiLU / swish: `x * sigmoid(x)`
pub fn silu(xs: &Tensor) -> Result<Tensor> {
    xs.mul(&sigmoid(xs)?)
}

/// Lower triangular `[t, t]` mask, 1 where query `i` may attend to key `j <= i`
pub fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j <= i)))
        .collect::<Vec<_>>();
    Tensor::from_vec(mask, (t, t), device)
}

/// `softmax(Q K^T / sqrt(d_k)) V`
///
/// `q` is `[..., t_q, d_k]`, `k` is `[..., t_k, d_k]`, `v` is `[..., t_k, d_v]`.
/// `mask` broadcasts to `[..., t_q, t_k]`; positions where it is 0 get no attention.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let d_k = q.dim(D::Minus1)?;
    let scores = (q.contiguous()?.matmul(&k.t()?.contiguous()?)? / (d_k as f64).sqrt())?;
    let scores = match mask {
        Some(mask) => {
            let mask = mask.broadcast_as(scores.shape())?;
            let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
                .to_dtype(scores.dtype())?
                .broadcast_as(scores.shape())?;
            mask.where_cond(&scores, &neg_inf)?
        }
        None => scores,
    };
    softmax(&scores, D::Minus1, 1.0)?.matmul(&v.contiguous()?)
}

/// Mean cross entropy between `logits` of shape `[n, classes]` and integer `targets` of shape `[n]`
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let targets = targets.to_dtype(DType::U32)?;
    let log_probs = log_softmax(logits, D::Minus1)?;
    log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?
        .mean_all()
}
