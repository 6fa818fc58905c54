//! Full child networks: the weight-shared search model and the fixed model
//!
//! Both share the same skeleton: a 3x3 stem, `num_layers` searchable layers
//! and two pooling checkpoints at one-third and two-thirds of the depth.
//! At a checkpoint every accumulated layer output is halved spatially so
//! that later skip connections always fuse equal shapes. The shared model
//! keeps the channel count constant across the whole network; the fixed
//! model doubles it at every checkpoint, like a conventional CNN.

use candle_core::{Module, Tensor, D};
use candle_nn::{conv2d_no_bias, linear, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::arch::Architecture;
use crate::cnn::branches::{instance_norm, FactorizedReduction};
use crate::cnn::layer::{FixedLayer, SharedLayer};
use crate::error::{EnasError, Result};

/// Hyperparameters of the child network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildConfig {
    /// Number of searchable layers
    pub num_layers: usize,
    /// Channel count of every layer (starting value for the fixed model)
    pub out_filters: usize,
    /// Probability of keeping an activation in the pre-classifier dropout
    pub keep_prob: f64,
    /// Number of output classes
    pub num_classes: usize,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            num_layers: 12,
            out_filters: 36,
            keep_prob: 0.9,
            num_classes: 10,
        }
    }
}

impl ChildConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_layers < 3 {
            return Err(EnasError::Config(format!(
                "need at least 3 layers to place pooling checkpoints, got {}",
                self.num_layers
            )));
        }
        if self.out_filters == 0 || self.out_filters % 2 != 0 {
            return Err(EnasError::Config(format!(
                "out_filters must be a positive even number, got {}",
                self.out_filters
            )));
        }
        if !(0.0..=1.0).contains(&self.keep_prob) {
            return Err(EnasError::Config(format!(
                "keep_prob must be in [0, 1], got {}",
                self.keep_prob
            )));
        }
        Ok(())
    }

    /// Layer indices after which the spatial resolution is halved
    pub fn pool_checkpoints(&self) -> [usize; 2] {
        let pool_distance = self.num_layers / 3;
        [pool_distance - 1, 2 * pool_distance - 1]
    }
}

fn stem_conv(out_filters: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(conv2d_no_bias(
        3,
        out_filters,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )?)
}

fn global_avg_pool(x: &Tensor) -> Result<Tensor> {
    // [b, c, h, w] -> [b, c]
    Ok(x.mean(D::Minus1)?.mean(D::Minus1)?)
}

/// Search-time child network. One parameter set serves every architecture
/// in the search space; the sampled descriptor selects which subset of
/// branches participates in a given forward pass.
#[derive(Debug)]
pub struct SharedCnn {
    stem: Conv2d,
    layers: Vec<SharedLayer>,
    /// One group of reductions per checkpoint, one reduction per layer
    /// accumulated up to that point
    reductions: Vec<Vec<FactorizedReduction>>,
    pool_checkpoints: [usize; 2],
    dropout: Dropout,
    classifier: Linear,
    num_layers: usize,
}

impl SharedCnn {
    pub fn new(cfg: &ChildConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let out_filters = cfg.out_filters;
        let pool_checkpoints = cfg.pool_checkpoints();

        let stem = stem_conv(out_filters, vb.pp("stem"))?;
        let mut layers = Vec::with_capacity(cfg.num_layers);
        let mut reductions = Vec::new();
        for layer_id in 0..cfg.num_layers {
            layers.push(SharedLayer::new(
                out_filters,
                out_filters,
                vb.pp(format!("layer_{layer_id}")),
            )?);
            if pool_checkpoints.contains(&layer_id) {
                let group = (0..=layer_id)
                    .map(|i| {
                        FactorizedReduction::new(
                            out_filters,
                            out_filters,
                            2,
                            vb.pp(format!("pool_{layer_id}_{i}")),
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                reductions.push(group);
            }
        }

        Ok(Self {
            stem,
            layers,
            reductions,
            pool_checkpoints,
            dropout: Dropout::new(1.0 - cfg.keep_prob as f32),
            classifier: linear(out_filters, cfg.num_classes, vb.pp("classifier"))?,
            num_layers: cfg.num_layers,
        })
    }

    /// Class logits for `x` under the sub-network selected by `arch`
    pub fn forward(&self, x: &Tensor, arch: &Architecture, train: bool) -> Result<Tensor> {
        arch.validate(self.num_layers)?;

        let mut x = instance_norm(&self.stem.forward(x)?)?;
        let mut prev: Vec<Tensor> = Vec::with_capacity(self.num_layers);
        let mut checkpoint = 0;
        for (layer_id, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, &prev, &arch.layers()[layer_id], train)?;
            prev.push(x.clone());
            if self.pool_checkpoints.contains(&layer_id) {
                // reconcile by building a fresh downsampled list
                prev = prev
                    .iter()
                    .zip(&self.reductions[checkpoint])
                    .map(|(out, reduce)| reduce.forward(out))
                    .collect::<Result<Vec<_>>>()?;
                x = prev[prev.len() - 1].clone();
                checkpoint += 1;
            }
        }

        let x = global_avg_pool(&x)?;
        let x = self.dropout.forward(&x, train)?;
        Ok(self.classifier.forward(&x)?)
    }

    /// Inference-mode class logits for a sampled architecture
    pub fn evaluate(&self, x: &Tensor, arch: &Architecture) -> Result<Tensor> {
        self.forward(x, arch, false)
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }
}

/// Stand-alone network for one finalized architecture, with its own
/// parameters and channel doubling at each pooling checkpoint
#[derive(Debug)]
pub struct FixedCnn {
    stem: Conv2d,
    layers: Vec<FixedLayer>,
    reductions: Vec<Vec<FactorizedReduction>>,
    pool_checkpoints: [usize; 2],
    dropout: Dropout,
    classifier: Linear,
}

impl FixedCnn {
    pub fn new(cfg: &ChildConfig, arch: &Architecture, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        arch.validate(cfg.num_layers)?;
        let mut out_filters = cfg.out_filters;
        let pool_checkpoints = cfg.pool_checkpoints();

        let stem = stem_conv(out_filters, vb.pp("stem"))?;
        let mut layers = Vec::with_capacity(cfg.num_layers);
        let mut reductions = Vec::new();
        for layer_id in 0..cfg.num_layers {
            layers.push(FixedLayer::new(
                layer_id,
                out_filters,
                out_filters,
                &arch.layers()[layer_id],
                vb.pp(format!("layer_{layer_id}")),
            )?);
            if pool_checkpoints.contains(&layer_id) {
                let group = (0..=layer_id)
                    .map(|i| {
                        FactorizedReduction::new(
                            out_filters,
                            out_filters * 2,
                            2,
                            vb.pp(format!("pool_{layer_id}_{i}")),
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                reductions.push(group);
                out_filters *= 2;
            }
        }

        Ok(Self {
            stem,
            layers,
            reductions,
            pool_checkpoints,
            dropout: Dropout::new(1.0 - cfg.keep_prob as f32),
            classifier: linear(out_filters, cfg.num_classes, vb.pp("classifier"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = instance_norm(&self.stem.forward(x)?)?;
        let mut prev: Vec<Tensor> = Vec::with_capacity(self.layers.len());
        let mut checkpoint = 0;
        for (layer_id, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, &prev, train)?;
            prev.push(x.clone());
            if self.pool_checkpoints.contains(&layer_id) {
                prev = prev
                    .iter()
                    .zip(&self.reductions[checkpoint])
                    .map(|(out, reduce)| reduce.forward(out))
                    .collect::<Result<Vec<_>>>()?;
                x = prev[prev.len() - 1].clone();
                checkpoint += 1;
            }
        }

        let x = global_avg_pool(&x)?;
        let x = self.dropout.forward(&x, train)?;
        Ok(self.classifier.forward(&x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{LayerChoice, OpKind};
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn small_config() -> ChildConfig {
        ChildConfig {
            num_layers: 4,
            out_filters: 8,
            keep_prob: 1.0,
            num_classes: 10,
        }
    }

    fn test_vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    fn dense_arch(num_layers: usize) -> Architecture {
        let layers = (0..num_layers)
            .map(|i| LayerChoice::new(OpKind::all()[i % 6], vec![true; i]))
            .collect();
        Architecture::new(layers).unwrap()
    }

    #[test]
    fn test_pool_checkpoint_placement() {
        let cfg = ChildConfig {
            num_layers: 12,
            ..Default::default()
        };
        assert_eq!(cfg.pool_checkpoints(), [3, 7]);
        assert_eq!(small_config().pool_checkpoints(), [0, 1]);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = small_config();
        cfg.out_filters = 7;
        assert!(cfg.validate().is_err());
        cfg = small_config();
        cfg.num_layers = 2;
        assert!(cfg.validate().is_err());
        cfg = small_config();
        cfg.keep_prob = 1.5;
        assert!(cfg.validate().is_err());
        assert!(small_config().validate().is_ok());
    }

    #[test]
    fn test_shared_forward_end_to_end() {
        let cfg = small_config();
        let (_vm, vb) = test_vb();
        let net = SharedCnn::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 3, 32, 32), &Device::Cpu).unwrap();

        // every operator appears and every possible skip is taken
        let logits = net.forward(&x, &dense_arch(4), true).unwrap();
        assert_eq!(logits.dims(), &[3, 10]);
        let v = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_evaluate_matches_inference_forward() {
        let cfg = small_config();
        let (_vm, vb) = test_vb();
        let net = SharedCnn::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let arch = dense_arch(4);

        let a = net.evaluate(&x, &arch).unwrap();
        let b = net.forward(&x, &arch, false).unwrap();
        let diff = (&a - &b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_all_conv3x3_no_skip_spatial_ladder() {
        // the plainest descriptor: operator 0 everywhere, every skip off
        let cfg = small_config();
        let (_vm, vb) = test_vb();
        let net = SharedCnn::new(&cfg, vb).unwrap();
        let arch = Architecture::uniform(OpKind::Conv3x3, 4);
        let input = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();

        // walk the layers the way forward does, recording the resolution
        // after each pooling checkpoint
        let mut x = crate::cnn::branches::instance_norm(&net.stem.forward(&input).unwrap()).unwrap();
        assert_eq!(x.dims(), &[2, 8, 32, 32]);
        let mut prev: Vec<Tensor> = Vec::new();
        let mut checkpoint = 0;
        let mut ladder = Vec::new();
        for (layer_id, layer) in net.layers.iter().enumerate() {
            x = layer
                .forward(&x, &prev, &arch.layers()[layer_id], false)
                .unwrap();
            prev.push(x.clone());
            if net.pool_checkpoints.contains(&layer_id) {
                prev = prev
                    .iter()
                    .zip(&net.reductions[checkpoint])
                    .map(|(out, reduce)| reduce.forward(out).unwrap())
                    .collect();
                x = prev[prev.len() - 1].clone();
                checkpoint += 1;
                ladder.push(x.dims().to_vec());
            }
        }
        assert_eq!(ladder, vec![vec![2, 8, 16, 16], vec![2, 8, 8, 8]]);

        let logits = net.forward(&input, &arch, false).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
        let v = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_shared_forward_no_skips() {
        let cfg = small_config();
        let (_vm, vb) = test_vb();
        let net = SharedCnn::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let arch = Architecture::uniform(OpKind::MaxPool3x3, 4);
        let logits = net.forward(&x, &arch, false).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
    }

    #[test]
    fn test_shared_forward_rejects_wrong_depth() {
        let cfg = small_config();
        let (_vm, vb) = test_vb();
        let net = SharedCnn::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let arch = Architecture::uniform(OpKind::Conv3x3, 5);
        assert!(net.forward(&x, &arch, false).is_err());
    }

    #[test]
    fn test_fixed_forward_doubles_channels() {
        let cfg = small_config();
        let (_vm, vb) = test_vb();
        let net = FixedCnn::new(&cfg, &dense_arch(4), vb).unwrap();
        // two checkpoints double 8 -> 32 before the classifier
        assert_eq!(net.classifier.weight().dims(), &[10, 32]);

        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let logits = net.forward(&x, false).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
    }
}
