//! Optimizer(s) and learning rate scheduling

use candle_core::{Tensor, Var, backprop::GradStore};
use thiserror::Error;

/// Errors for the optimizers
#[derive(Debug, Error)]
pub enum OptimError {
    #[error("Invalid optimizer setting: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
///
/// There is no `zero_grad`: every `backward` call hands back a fresh [`GradStore`].
pub trait Optim {
    /// Performs a single optimization step with the given gradients.
    /// Parameters without a gradient are left untouched.
    fn step(&mut self, grads: &GradStore) -> Result<(), OptimError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn backward_step(&mut self, loss: &Tensor) -> Result<(), OptimError> {
        let grads = loss.backward()?;
        self.step(&grads)
    }
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Var>,
    lr: f64,
    momentum: f64,
    // velocity per parameter
    velocity: Vec<Var>,
}

impl SGD {
    pub fn new(params: Vec<Var>, lr: f64, momentum: f64) -> Result<Self, OptimError> {
        let velocity = params
            .iter()
            .map(|p| Var::zeros(p.shape(), p.dtype(), p.device()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            params,
            lr,
            momentum,
            velocity,
        })
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Var] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self, grads: &GradStore) -> Result<(), OptimError> {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter()) {
            let Some(grad) = grads.get(param.as_tensor()) else {
                continue;
            };
            let next = ((velocity.as_tensor() * self.momentum)? - (grad * self.lr)?)?;
            param.set(&(param.as_tensor() + &next)?)?;
            velocity.set(&next)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Settings for [`Adam`], defaults follow `torch.optim.Adam`
#[derive(Debug, Clone, Copy)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct AdamState {
    param: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam with bias corrected moment estimates
pub struct Adam {
    states: Vec<AdamState>,
    params: AdamParams,
    step_t: usize,
}

impl Adam {
    pub fn new(vars: Vec<Var>, params: AdamParams) -> Result<Self, OptimError> {
        if !(0.0..1.0).contains(&params.beta1) || !(0.0..1.0).contains(&params.beta2) {
            return Err(OptimError::InvalidConfig(format!(
                "betas must be in [0, 1), got ({}, {})",
                params.beta1, params.beta2
            )));
        }
        let states = vars
            .into_iter()
            .map(|param| {
                let first_moment = Var::zeros(param.shape(), param.dtype(), param.device())?;
                let second_moment = Var::zeros(param.shape(), param.dtype(), param.device())?;
                Ok(AdamState {
                    param,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>, candle_core::Error>>()?;
        Ok(Self {
            states,
            params,
            step_t: 0,
        })
    }
}

impl Optim for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<(), OptimError> {
        self.step_t += 1;
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let bias1 = 1.0 - beta1.powi(self.step_t as i32);
        let bias2 = 1.0 - beta2.powi(self.step_t as i32);
        for state in &self.states {
            let Some(grad) = grads.get(state.param.as_tensor()) else {
                continue;
            };
            let grad = if weight_decay != 0.0 {
                (grad + (state.param.as_tensor() * weight_decay)?)?
            } else {
                grad.clone()
            };
            let m = ((state.first_moment.as_tensor() * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((state.second_moment.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = (m_hat.div(&(v_hat.sqrt()? + eps)?)? * lr)?;
            state.param.set(&(state.param.as_tensor() - update)?)?;
            state.first_moment.set(&m)?;
            state.second_moment.set(&v)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` calls to [`StepLR::step`].
/// Analogous to `torch.optim.lr_scheduler.StepLR`
pub struct StepLR {
    step_size: usize,
    gamma: f64,
    base_lr: f64,
    last_step: usize,
}

impl StepLR {
    pub fn new<O: Optim + ?Sized>(optim: &O, step_size: usize, gamma: f64) -> Result<Self, OptimError> {
        if step_size == 0 {
            return Err(OptimError::InvalidConfig(
                "step_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            step_size,
            gamma,
            base_lr: optim.learning_rate(),
            last_step: 0,
        })
    }

    pub fn step<O: Optim + ?Sized>(&mut self, optim: &mut O) {
        self.last_step += 1;
        let decays = (self.last_step / self.step_size) as i32;
        let lr = self.base_lr * self.gamma.powi(decays);
        if lr != optim.learning_rate() {
            log::debug!("step {}: learning rate set to {lr}", self.last_step);
            optim.set_learning_rate(lr);
        }
    }
}

/// Rescales `grads` in place so their global L2 norm is at most `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, params: &[Var], max_norm: f64) -> Result<f64, OptimError> {
    let mut total = 0f64;
    for param in params {
        if let Some(grad) = grads.get(param.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for param in params {
            if let Some(grad) = grads.get(param.as_tensor()) {
                let clipped = (grad * scale)?;
                grads.insert(param.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::assert_close;

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_sgd_no_momentum() {
        let a = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let loss = a.as_tensor().sum_all().unwrap();
        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.0).unwrap();
        optim.backward_step(&loss).unwrap();
        let a = values(&a);
        assert_close!(a[0], 0.9);
        assert_close!(a[1], 1.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.9).unwrap();
        // the gradient of a sum is always 1
        optim.backward_step(&a.as_tensor().sum_all().unwrap()).unwrap();
        assert_close!(values(&a)[0], 0.9);
        assert_close!(values(&a)[1], 1.9);
        assert_close!(values(&optim.velocities()[0])[0], -0.1);

        optim.backward_step(&a.as_tensor().sum_all().unwrap()).unwrap();
        assert_close!(values(&a)[0], 0.71);
        assert_close!(values(&a)[1], 1.71);
        assert_close!(values(&optim.velocities()[0])[1], -0.19);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let a = Var::new(&[1f32, -2.0], &Device::Cpu).unwrap();
        let params = AdamParams {
            lr: 0.01,
            ..Default::default()
        };
        let mut optim = Adam::new(vec![a.clone()], params).unwrap();
        let loss = a.as_tensor().sqr().unwrap().sum_all().unwrap();
        optim.backward_step(&loss).unwrap();
        // with bias correction the first update is lr * sign(grad)
        let a = values(&a);
        assert_close!(a[0], 0.99);
        assert_close!(a[1], -1.99);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let a = Var::new(&[3f32, -4.0], &Device::Cpu).unwrap();
        let params = AdamParams {
            lr: 0.1,
            ..Default::default()
        };
        let mut optim = Adam::new(vec![a.clone()], params).unwrap();
        for _ in 0..1000 {
            let loss = a.as_tensor().sqr().unwrap().sum_all().unwrap();
            optim.backward_step(&loss).unwrap();
        }
        assert!(values(&a).iter().all(|v| v.abs() < 0.05));
    }

    #[test]
    fn test_adam_invalid_betas() {
        let params = AdamParams {
            beta1: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            Adam::new(vec![], params),
            Err(OptimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_step_lr() {
        let a = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut optim = SGD::new(vec![a], 1.0, 0.0).unwrap();
        let mut scheduler = StepLR::new(&optim, 2, 0.5).unwrap();
        let mut lrs = vec![];
        for _ in 0..5 {
            scheduler.step(&mut optim);
            lrs.push(optim.learning_rate());
        }
        assert_eq!(lrs, vec![1.0, 0.5, 0.5, 0.25, 0.25]);
        assert!(StepLR::new(&optim, 0, 0.5).is_err());
    }

    #[test]
    fn test_clip_grad_norm() {
        let a = Var::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let loss = (a.as_tensor() * 1.0).unwrap();
        let loss = loss.mul(a.as_tensor()).unwrap().sum_all().unwrap();
        // gradient of sum(a^2) is 2a = [6, 8], norm 10
        let mut grads = loss.backward().unwrap();
        let norm = clip_grad_norm(&mut grads, &[a.clone()], 5.0).unwrap();
        assert_close!(norm, 10.0);
        let clipped = grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_close!(clipped[0], 3.0);
        assert_close!(clipped[1], 4.0);

        // already small enough, nothing changes
        let norm = clip_grad_norm(&mut grads, &[a.clone()], 100.0).unwrap();
        assert_close!(norm, 5.0);
    }
}
