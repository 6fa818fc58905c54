//! The six candidate per-layer operators and the factorized reduction
//!
//! Every branch is stride 1 with "same" padding, so feature maps keep their
//! spatial size and map `in_planes -> out_planes` channels. Normalization
//! uses per-sample (instance) statistics: the effective network changes
//! with every sampled architecture, which makes batch statistics unstable
//! across the weight-sharing population. The 1x1-reduce sub-blocks inside
//! the conv branches are the exception and keep batch statistics.

use candle_core::{Module, Tensor, D};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

use crate::arch::OpKind;
use crate::error::{EnasError, Result};

/// Per-sample, per-channel normalization over the spatial dimensions.
/// No affine parameters, eps 1e-5.
pub fn instance_norm(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
    let denom = (var + 1e-5)?.sqrt()?;
    Ok(centered.broadcast_div(&denom)?)
}

/// Depthwise k x k convolution followed by a pointwise 1x1 projection
#[derive(Debug)]
pub struct SeparableConv {
    depthwise: Conv2d,
    pointwise: Conv2d,
}

impl SeparableConv {
    pub fn new(in_planes: usize, out_planes: usize, kernel: usize, vb: VarBuilder) -> Result<Self> {
        let padding = (kernel - 1) / 2;
        let depthwise = conv2d_no_bias(
            in_planes,
            in_planes,
            kernel,
            Conv2dConfig {
                padding,
                groups: in_planes,
                ..Default::default()
            },
            vb.pp("depthwise"),
        )?;
        let pointwise = conv2d_no_bias(in_planes, out_planes, 1, Conv2dConfig::default(), vb.pp("pointwise"))?;
        Ok(Self { depthwise, pointwise })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.depthwise.forward(x)?;
        Ok(self.pointwise.forward(&out)?)
    }
}

#[derive(Debug)]
enum ConvKernel {
    Plain(Conv2d),
    Separable(SeparableConv),
}

/// Convolution branch: 1x1 reduce -> BN -> ReLU, then a k x k convolution
/// (plain or depthwise-separable) -> BN -> ReLU
#[derive(Debug)]
pub struct ConvBranch {
    reduce: Conv2d,
    reduce_bn: BatchNorm,
    conv: ConvKernel,
    conv_bn: BatchNorm,
}

impl ConvBranch {
    pub fn new(
        in_planes: usize,
        out_planes: usize,
        kernel: usize,
        separable: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if kernel != 3 && kernel != 5 {
            return Err(EnasError::Config(format!(
                "conv branch kernel must be 3 or 5, got {kernel}"
            )));
        }
        let reduce = conv2d_no_bias(in_planes, out_planes, 1, Conv2dConfig::default(), vb.pp("reduce"))?;
        let reduce_bn = batch_norm(out_planes, BatchNormConfig::default(), vb.pp("reduce_bn"))?;
        let conv = if separable {
            ConvKernel::Separable(SeparableConv::new(out_planes, out_planes, kernel, vb.pp("sep"))?)
        } else {
            let padding = (kernel - 1) / 2;
            ConvKernel::Plain(conv2d_no_bias(
                out_planes,
                out_planes,
                kernel,
                Conv2dConfig {
                    padding,
                    ..Default::default()
                },
                vb.pp("conv"),
            )?)
        };
        let conv_bn = batch_norm(out_planes, BatchNormConfig::default(), vb.pp("conv_bn"))?;
        Ok(Self {
            reduce,
            reduce_bn,
            conv,
            conv_bn,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.reduce.forward(x)?;
        let out = self.reduce_bn.forward_t(&out, train)?.relu()?;
        let out = match &self.conv {
            ConvKernel::Plain(conv) => conv.forward(&out)?,
            ConvKernel::Separable(sep) => sep.forward(&out)?,
        };
        Ok(self.conv_bn.forward_t(&out, train)?.relu()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolMode {
    Avg,
    Max,
}

/// Pooling branch: 1x1 reduce -> instance norm -> ReLU -> 3x3 pool, stride 1
#[derive(Debug)]
pub struct PoolBranch {
    reduce: Conv2d,
    mode: PoolMode,
}

impl PoolBranch {
    fn new(in_planes: usize, out_planes: usize, mode: PoolMode, vb: VarBuilder) -> Result<Self> {
        let reduce = conv2d_no_bias(in_planes, out_planes, 1, Conv2dConfig::default(), vb.pp("reduce"))?;
        Ok(Self { reduce, mode })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.reduce.forward(x)?;
        let out = instance_norm(&out)?.relu()?;
        // zero-pad to "same" size; inputs are post-ReLU so zero padding is
        // neutral for the max case as well
        let out = out
            .pad_with_zeros(D::Minus1, 1, 1)?
            .pad_with_zeros(D::Minus2, 1, 1)?;
        let out = match self.mode {
            PoolMode::Avg => out.avg_pool2d_with_stride(3, 1)?,
            PoolMode::Max => out.max_pool2d_with_stride(3, 1)?,
        };
        Ok(out)
    }
}

/// Tagged union over the six candidate operators. The shared layer holds
/// one of each and dispatches on the sampled `OpKind`.
#[derive(Debug)]
pub enum BranchOp {
    Conv3x3(ConvBranch),
    SepConv3x3(ConvBranch),
    Conv5x5(ConvBranch),
    SepConv5x5(ConvBranch),
    AvgPool3x3(PoolBranch),
    MaxPool3x3(PoolBranch),
}

impl BranchOp {
    pub fn build(kind: OpKind, in_planes: usize, out_planes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            OpKind::Conv3x3 => Self::Conv3x3(ConvBranch::new(in_planes, out_planes, 3, false, vb)?),
            OpKind::SepConv3x3 => Self::SepConv3x3(ConvBranch::new(in_planes, out_planes, 3, true, vb)?),
            OpKind::Conv5x5 => Self::Conv5x5(ConvBranch::new(in_planes, out_planes, 5, false, vb)?),
            OpKind::SepConv5x5 => Self::SepConv5x5(ConvBranch::new(in_planes, out_planes, 5, true, vb)?),
            OpKind::AvgPool3x3 => Self::AvgPool3x3(PoolBranch::new(in_planes, out_planes, PoolMode::Avg, vb)?),
            OpKind::MaxPool3x3 => Self::MaxPool3x3(PoolBranch::new(in_planes, out_planes, PoolMode::Max, vb)?),
        })
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Conv3x3(_) => OpKind::Conv3x3,
            Self::SepConv3x3(_) => OpKind::SepConv3x3,
            Self::Conv5x5(_) => OpKind::Conv5x5,
            Self::SepConv5x5(_) => OpKind::SepConv5x5,
            Self::AvgPool3x3(_) => OpKind::AvgPool3x3,
            Self::MaxPool3x3(_) => OpKind::MaxPool3x3,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Conv3x3(b) | Self::SepConv3x3(b) | Self::Conv5x5(b) | Self::SepConv5x5(b) => {
                b.forward(x, train)
            }
            Self::AvgPool3x3(b) | Self::MaxPool3x3(b) => b.forward(x),
        }
    }
}

#[derive(Debug)]
enum Reduction {
    /// stride 1: plain 1x1 projection
    Project(Conv2d),
    /// stride 2: two offset-sampled paths concatenated on the channel axis.
    /// The second path samples a one-pixel-shifted grid, which avoids the
    /// checkerboard aliasing of naive strided pooling.
    Halve { path1: Conv2d, path2: Conv2d },
}

/// Halves the spatial resolution (stride 2) and/or changes the channel
/// count of a feature map. Applied to every accumulated feature map at the
/// network's pooling checkpoints.
#[derive(Debug)]
pub struct FactorizedReduction {
    inner: Reduction,
}

impl FactorizedReduction {
    pub fn new(in_planes: usize, out_planes: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let inner = match stride {
            1 => Reduction::Project(conv2d_no_bias(
                in_planes,
                out_planes,
                1,
                Conv2dConfig::default(),
                vb.pp("proj"),
            )?),
            2 => {
                if out_planes % 2 != 0 {
                    return Err(EnasError::Config(format!(
                        "factorized reduction needs an even channel count, got {out_planes}"
                    )));
                }
                let path1 = conv2d_no_bias(
                    in_planes,
                    out_planes / 2,
                    1,
                    Conv2dConfig::default(),
                    vb.pp("path1"),
                )?;
                let path2 = conv2d_no_bias(
                    in_planes,
                    out_planes / 2,
                    1,
                    Conv2dConfig::default(),
                    vb.pp("path2"),
                )?;
                Reduction::Halve { path1, path2 }
            }
            other => {
                return Err(EnasError::Config(format!(
                    "factorized reduction stride must be 1 or 2, got {other}"
                )))
            }
        };
        Ok(Self { inner })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.inner {
            Reduction::Project(proj) => instance_norm(&proj.forward(x)?),
            Reduction::Halve { path1, path2 } => {
                let (_, _, h, w) = x.dims4()?;
                let p1 = x.avg_pool2d_with_stride(1, 2)?;
                let p1 = path1.forward(&p1)?;

                // pad the right and the bottom, then crop off the first row
                // and column: the same grid shifted by one pixel
                let shifted = x
                    .pad_with_zeros(D::Minus1, 0, 1)?
                    .pad_with_zeros(D::Minus2, 0, 1)?
                    .narrow(2, 1, h)?
                    .narrow(3, 1, w)?;
                let p2 = shifted.avg_pool2d_with_stride(1, 2)?;
                let p2 = path2.forward(&p2)?;

                instance_norm(&Tensor::cat(&[&p1, &p2], 1)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn test_vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn test_every_branch_preserves_shape() {
        let (_vm, vb) = test_vb();
        let x = Tensor::randn(0f32, 1f32, (2, 8, 16, 16), &Device::Cpu).unwrap();
        for kind in OpKind::all() {
            let branch = BranchOp::build(kind, 8, 8, vb.pp(format!("b{}", kind.id()))).unwrap();
            let out = branch.forward(&x, true).unwrap();
            assert_eq!(out.dims(), &[2, 8, 16, 16], "branch {kind:?}");
        }
    }

    #[test]
    fn test_factorized_reduction_halves_spatial_dims() {
        let (_vm, vb) = test_vb();
        let fr = FactorizedReduction::new(8, 8, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 8, 32, 32), &Device::Cpu).unwrap();
        let out = fr.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 8, 16, 16]);
    }

    #[test]
    fn test_factorized_reduction_changes_channels() {
        let (_vm, vb) = test_vb();
        let fr = FactorizedReduction::new(8, 16, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 8, 8, 8), &Device::Cpu).unwrap();
        let out = fr.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 16, 4, 4]);
    }

    #[test]
    fn test_factorized_reduction_stride_one_projects_only() {
        let (_vm, vb) = test_vb();
        let fr = FactorizedReduction::new(8, 12, 1, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 8, 8, 8), &Device::Cpu).unwrap();
        let out = fr.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 12, 8, 8]);
    }

    #[test]
    fn test_factorized_reduction_rejects_odd_channels() {
        let (_vm, vb) = test_vb();
        assert!(FactorizedReduction::new(8, 7, 2, vb).is_err());
    }

    #[test]
    fn test_instance_norm_statistics() {
        let x = Tensor::randn(1f32, 3f32, (2, 4, 8, 8), &Device::Cpu).unwrap();
        let out = instance_norm(&x).unwrap();
        let mean = out
            .mean_keepdim(D::Minus1)
            .unwrap()
            .mean_keepdim(D::Minus2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for m in mean {
            assert!(m.abs() < 1e-4, "per-channel mean should be ~0, got {m}");
        }
    }
}
