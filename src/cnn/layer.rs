//! Shared and fixed layer variants
//!
//! The dynamic [`SharedLayer`] carries all six branch operators and is used
//! during the search: every forward call picks one branch and fuses skip
//! activations by element-wise addition. The [`FixedLayer`] materializes a
//! single finalized choice with its own (non-shared) parameters and fuses
//! by channel concatenation followed by a learned 1x1 reduction, which
//! allows dedicated fine-tuning of one discovered architecture.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

use crate::arch::{LayerChoice, OpKind};
use crate::cnn::branches::{instance_norm, BranchOp};
use crate::error::{EnasError, Result};

fn check_fusion_shape(out: &Tensor, prev: &Tensor) -> Result<()> {
    if out.dims() != prev.dims() {
        return Err(EnasError::ShapeMismatch {
            expected: out.dims().to_vec(),
            actual: prev.dims().to_vec(),
        });
    }
    Ok(())
}

/// Search-time layer holding one weight-shared instance of every branch
#[derive(Debug)]
pub struct SharedLayer {
    branches: Vec<BranchOp>,
}

impl SharedLayer {
    pub fn new(in_planes: usize, out_planes: usize, vb: VarBuilder) -> Result<Self> {
        let branches = OpKind::all()
            .iter()
            .map(|&kind| {
                BranchOp::build(kind, in_planes, out_planes, vb.pp(format!("branch_{}", kind.id())))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { branches })
    }

    /// Run the branch selected by `choice` and add in every previous output
    /// whose skip flag is set. All `prev` entries must already be
    /// shape-reconciled by the network's pooling checkpoints.
    pub fn forward(
        &self,
        x: &Tensor,
        prev: &[Tensor],
        choice: &LayerChoice,
        train: bool,
    ) -> Result<Tensor> {
        if choice.skips.len() != prev.len() {
            return Err(EnasError::MalformedArchitecture {
                layer: prev.len(),
                expected: format!("{} skip flags", prev.len()),
                actual: format!("{} skip flags", choice.skips.len()),
            });
        }
        let branch = &self.branches[choice.op.id()];
        let mut out = branch.forward(x, train)?;
        for (prev_out, &skip) in prev.iter().zip(choice.skips.iter()) {
            if skip {
                check_fusion_shape(&out, prev_out)?;
                out = out.add(prev_out)?;
            }
        }
        instance_norm(&out)
    }
}

/// Finalized layer for a single architecture descriptor
#[derive(Debug)]
pub struct FixedLayer {
    branch: BranchOp,
    skips: Vec<bool>,
    dim_reduce: Conv2d,
}

impl FixedLayer {
    /// Builds the chosen branch plus the 1x1 fusion reduction. The skip
    /// vector must have exactly `layer_id` entries; the reduction input is
    /// `out_planes * (1 + number of true skips)` channels.
    pub fn new(
        layer_id: usize,
        in_planes: usize,
        out_planes: usize,
        choice: &LayerChoice,
        vb: VarBuilder,
    ) -> Result<Self> {
        if choice.skips.len() != layer_id {
            return Err(EnasError::MalformedArchitecture {
                layer: layer_id,
                expected: format!("{layer_id} skip flags"),
                actual: format!("{} skip flags", choice.skips.len()),
            });
        }
        let branch = BranchOp::build(choice.op, in_planes, out_planes, vb.pp("branch"))?;
        let fuse_in = out_planes * (1 + choice.num_skips());
        let dim_reduce = conv2d_no_bias(fuse_in, out_planes, 1, Conv2dConfig::default(), vb.pp("dim_reduce"))?;
        Ok(Self {
            branch,
            skips: choice.skips.clone(),
            dim_reduce,
        })
    }

    pub fn forward(&self, x: &Tensor, prev: &[Tensor], train: bool) -> Result<Tensor> {
        let out = self.branch.forward(x, train)?;
        let mut parts: Vec<&Tensor> = Vec::with_capacity(1 + self.skips.len());
        for (prev_out, &skip) in prev.iter().zip(self.skips.iter()) {
            if skip {
                check_fusion_shape(&out, prev_out)?;
                parts.push(prev_out);
            }
        }
        parts.push(&out);
        let fused = Tensor::cat(&parts, 1)?;
        let fused = self.dim_reduce.forward(&fused)?.relu()?;
        instance_norm(&fused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::LayerChoice;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn test_vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_layer_zero_skip_fusion_is_noop() {
        let (_vm, vb) = test_vb();
        let layer = SharedLayer::new(8, 8, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 8, 16, 16), &Device::Cpu).unwrap();
        let choice = LayerChoice::new(OpKind::Conv3x3, vec![]);

        let out = layer.forward(&x, &[], &choice, false).unwrap();
        // with no prior layers the output is exactly the normalized branch output
        let raw = layer.branches[0].forward(&x, false).unwrap();
        let expected = instance_norm(&raw).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);
    }

    #[test]
    fn test_shared_layer_adds_skip_activations() {
        let (_vm, vb) = test_vb();
        let layer = SharedLayer::new(4, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &Device::Cpu).unwrap();
        let prev = vec![Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &Device::Cpu).unwrap()];

        let choice = LayerChoice::new(OpKind::MaxPool3x3, vec![true]);
        let out = layer.forward(&x, &prev, &choice, false).unwrap();

        let raw = layer.branches[5].forward(&x, false).unwrap();
        let expected = instance_norm(&raw.add(&prev[0]).unwrap()).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);
    }

    #[test]
    fn test_shared_layer_rejects_wrong_skip_count() {
        let (_vm, vb) = test_vb();
        let layer = SharedLayer::new(4, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &Device::Cpu).unwrap();
        let choice = LayerChoice::new(OpKind::Conv3x3, vec![true, false]);
        let err = layer.forward(&x, &[], &choice, false).unwrap_err();
        assert!(matches!(err, EnasError::MalformedArchitecture { .. }));
    }

    #[test]
    fn test_shared_layer_rejects_unreconciled_shapes() {
        let (_vm, vb) = test_vb();
        let layer = SharedLayer::new(4, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &Device::Cpu).unwrap();
        // a previous output that was never downsampled
        let prev = vec![Tensor::randn(0f32, 1f32, (1, 4, 16, 16), &Device::Cpu).unwrap()];
        let choice = LayerChoice::new(OpKind::Conv3x3, vec![true]);
        let err = layer.forward(&x, &prev, &choice, false).unwrap_err();
        assert!(matches!(err, EnasError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_fixed_layer_fusion_channel_arithmetic() {
        // skip masks with zero, one and all-true entries
        for skips in [vec![false, false, false], vec![true, false, false], vec![true, true, true]] {
            let (_vm, vb) = test_vb();
            let n_skips = skips.iter().filter(|&&s| s).count();
            let choice = LayerChoice::new(OpKind::Conv3x3, skips);
            let layer = FixedLayer::new(3, 8, 8, &choice, vb).unwrap();

            let weight_dims = layer.dim_reduce.weight().dims().to_vec();
            assert_eq!(weight_dims[1], 8 * (1 + n_skips));

            let x = Tensor::randn(0f32, 1f32, (2, 8, 8, 8), &Device::Cpu).unwrap();
            let prev: Vec<Tensor> = (0..3)
                .map(|_| Tensor::randn(0f32, 1f32, (2, 8, 8, 8), &Device::Cpu).unwrap())
                .collect();
            let out = layer.forward(&x, &prev, false).unwrap();
            assert_eq!(out.dims(), &[2, 8, 8, 8]);
        }
    }

    #[test]
    fn test_fixed_layer_rejects_malformed_descriptor() {
        let (_vm, vb) = test_vb();
        let choice = LayerChoice::new(OpKind::Conv3x3, vec![true]);
        let err = FixedLayer::new(3, 8, 8, &choice, vb).unwrap_err();
        assert!(matches!(err, EnasError::MalformedArchitecture { layer: 3, .. }));
    }
}
