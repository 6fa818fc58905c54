//! Optimizers and learning-rate schedule for the child network
//!
//! candle-nn ships plain SGD only, so the momentum variant used for the
//! child network is implemented directly over the trainable `Var`s. The
//! gradient-norm bound is part of the step: gradients are rescaled before
//! any state is touched, so velocity never sees an unclipped update.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{EnasError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
    /// Global gradient-norm bound, applied across all parameters
    pub grad_bound: Option<f64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.05,
            momentum: 0.9,
            nesterov: true,
            weight_decay: 0.00025,
            grad_bound: Some(5.0),
        }
    }
}

/// Momentum SGD over an explicit parameter list
#[derive(Debug)]
pub struct Sgd {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    cfg: SgdConfig,
}

impl Sgd {
    pub fn new(vars: Vec<Var>, cfg: SgdConfig) -> Result<Self> {
        if cfg.lr <= 0.0 {
            return Err(EnasError::Config(format!(
                "learning rate must be positive, got {}",
                cfg.lr
            )));
        }
        let velocity = vec![None; vars.len()];
        Ok(Self {
            vars,
            velocity,
            cfg,
        })
    }

    pub fn lr(&self) -> f64 {
        self.cfg.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.cfg.lr = lr;
    }

    /// Global L2 norm over the gradients of the tracked parameters
    fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut sq_sum = 0.0f64;
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sq_sum += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(sq_sum.sqrt())
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let scale = match self.cfg.grad_bound {
            Some(bound) => {
                let norm = self.grad_norm(grads)?;
                if norm > bound {
                    bound / norm
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        for (var, vel) in self.vars.iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let mut g = (grad * scale)?;
            if self.cfg.weight_decay > 0.0 {
                g = (g + (var.as_tensor() * self.cfg.weight_decay)?)?;
            }
            let v = match vel.take() {
                Some(prev) => ((prev * self.cfg.momentum)? + &g)?,
                None => g.clone(),
            };
            let update = if self.cfg.nesterov {
                (&g + (&v * self.cfg.momentum)?)?
            } else {
                v.clone()
            };
            var.set(&(var.as_tensor() - (update * self.cfg.lr)?)?)?;
            *vel = Some(v);
        }
        Ok(())
    }
}

/// Cosine annealing between `lr_max` and `lr_min` with warm restarts every
/// `period` epochs
pub fn cosine_lr(epoch: usize, lr_max: f64, lr_min: f64, period: usize) -> f64 {
    let t = (epoch % period) as f64 / period as f64;
    lr_min + 0.5 * (lr_max - lr_min) * (1.0 + (std::f64::consts::PI * t).cos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_sgd_minimizes_quadratic() {
        let x = Var::from_tensor(&Tensor::new(&[10.0f32], &Device::Cpu).unwrap()).unwrap();
        let cfg = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            nesterov: true,
            weight_decay: 0.0,
            grad_bound: None,
        };
        let mut opt = Sgd::new(vec![x.clone()], cfg).unwrap();
        for _ in 0..100 {
            let diff = (x.as_tensor() - 3.0).unwrap();
            let loss = diff.sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let v = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((v - 3.0).abs() < 1e-2, "converged to {v}");
    }

    #[test]
    fn test_grad_bound_limits_first_update() {
        let x = Var::from_tensor(&Tensor::new(&[1000.0f32], &Device::Cpu).unwrap()).unwrap();
        let cfg = SgdConfig {
            lr: 1.0,
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.0,
            grad_bound: Some(5.0),
        };
        let mut opt = Sgd::new(vec![x.clone()], cfg).unwrap();
        let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
        // raw gradient is 2000, far beyond the bound
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        let v = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((v - 995.0).abs() < 1e-2, "update should be clipped to 5, got {v}");
    }

    #[test]
    fn test_weight_decay_shrinks_parameter() {
        let x = Var::from_tensor(&Tensor::new(&[2.0f32], &Device::Cpu).unwrap()).unwrap();
        let cfg = SgdConfig {
            lr: 0.5,
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.1,
            grad_bound: None,
        };
        let mut opt = Sgd::new(vec![x.clone()], cfg).unwrap();
        // zero data gradient, only decay applies
        let loss = (x.as_tensor() * 0.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        let v = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((v - 1.9).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_non_positive_lr() {
        let cfg = SgdConfig {
            lr: 0.0,
            ..Default::default()
        };
        assert!(Sgd::new(vec![], cfg).is_err());
    }

    #[test]
    fn test_cosine_schedule_endpoints_and_restart() {
        assert!((cosine_lr(0, 0.05, 0.001, 10) - 0.05).abs() < 1e-12);
        let mid = cosine_lr(5, 0.05, 0.001, 10);
        assert!((mid - 0.0255).abs() < 1e-12);
        // warm restart after a full period
        assert!((cosine_lr(10, 0.05, 0.001, 10) - 0.05).abs() < 1e-12);
        assert!(cosine_lr(9, 0.05, 0.001, 10) > 0.001);
    }
}
