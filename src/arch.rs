//! Architecture descriptors for the macro search space
//!
//! A descriptor assigns every layer one of six operators plus a set of
//! skip connections to earlier layers. It is immutable once sampled and is
//! consumed identically by the shared network and the fixed-model builder.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EnasError, Result};

/// Number of candidate operators per layer
pub const NUM_BRANCHES: usize = 6;

/// The six per-layer operators of the macro search space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// 3x3 convolution branch
    Conv3x3,
    /// 3x3 depthwise-separable convolution branch
    SepConv3x3,
    /// 5x5 convolution branch
    Conv5x5,
    /// 5x5 depthwise-separable convolution branch
    SepConv5x5,
    /// 3x3 average-pool branch
    AvgPool3x3,
    /// 3x3 max-pool branch
    MaxPool3x3,
}

impl OpKind {
    /// All operators, in token order
    pub fn all() -> [Self; NUM_BRANCHES] {
        [
            Self::Conv3x3,
            Self::SepConv3x3,
            Self::Conv5x5,
            Self::SepConv5x5,
            Self::AvgPool3x3,
            Self::MaxPool3x3,
        ]
    }

    /// Token id of this operator
    pub fn id(self) -> usize {
        match self {
            Self::Conv3x3 => 0,
            Self::SepConv3x3 => 1,
            Self::Conv5x5 => 2,
            Self::SepConv5x5 => 3,
            Self::AvgPool3x3 => 4,
            Self::MaxPool3x3 => 5,
        }
    }

    /// Operator for a sampled token id
    pub fn from_id(id: usize) -> Result<Self> {
        match id {
            0 => Ok(Self::Conv3x3),
            1 => Ok(Self::SepConv3x3),
            2 => Ok(Self::Conv5x5),
            3 => Ok(Self::SepConv5x5),
            4 => Ok(Self::AvgPool3x3),
            5 => Ok(Self::MaxPool3x3),
            _ => Err(EnasError::InvalidOperator { id }),
        }
    }
}

/// One layer's decision: an operator plus one skip flag per prior layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChoice {
    /// Selected operator
    pub op: OpKind,
    /// Skip flags, one per previous layer (empty for layer 0)
    pub skips: Vec<bool>,
}

impl LayerChoice {
    pub fn new(op: OpKind, skips: Vec<bool>) -> Self {
        Self { op, skips }
    }

    /// Number of skip connections taken by this layer
    pub fn num_skips(&self) -> usize {
        self.skips.iter().filter(|&&s| s).count()
    }
}

/// A complete sampled architecture, one `LayerChoice` per layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    layers: Vec<LayerChoice>,
}

impl Architecture {
    /// Build a descriptor from per-layer choices, validating skip lengths
    pub fn new(layers: Vec<LayerChoice>) -> Result<Self> {
        let arch = Self { layers };
        arch.check_skip_lengths()?;
        Ok(arch)
    }

    /// Descriptor using the same operator at every layer with no skips.
    /// Handy as a deterministic baseline architecture.
    pub fn uniform(op: OpKind, num_layers: usize) -> Self {
        let layers = (0..num_layers)
            .map(|i| LayerChoice::new(op, vec![false; i]))
            .collect();
        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[LayerChoice] {
        &self.layers
    }

    pub fn layer(&self, idx: usize) -> Option<&LayerChoice> {
        self.layers.get(idx)
    }

    /// Validate against a network of `num_layers` layers. Layer count and
    /// every skip-vector length must match; this runs before any forward
    /// pass so a malformed descriptor can never fail mid-evaluation.
    pub fn validate(&self, num_layers: usize) -> Result<()> {
        if self.layers.len() != num_layers {
            return Err(EnasError::MalformedArchitecture {
                layer: 0,
                expected: format!("{num_layers} layers"),
                actual: format!("{} layers", self.layers.len()),
            });
        }
        self.check_skip_lengths()
    }

    fn check_skip_lengths(&self) -> Result<()> {
        for (i, choice) in self.layers.iter().enumerate() {
            if choice.skips.len() != i {
                return Err(EnasError::MalformedArchitecture {
                    layer: i,
                    expected: format!("{i} skip flags"),
                    actual: format!("{} skip flags", choice.skips.len()),
                });
            }
        }
        Ok(())
    }

    /// Fraction of possible skip connections actually taken
    pub fn skip_rate(&self) -> f64 {
        let possible: usize = (0..self.layers.len()).sum();
        if possible == 0 {
            return 0.0;
        }
        let taken: usize = self.layers.iter().map(|l| l.num_skips()).sum();
        taken as f64 / possible as f64
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let arch: Self = serde_json::from_str(json)?;
        arch.check_skip_lengths()?;
        Ok(arch)
    }
}

impl fmt::Display for Architecture {
    /// One line per layer: `[op_id skip_0 skip_1 ...]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, choice) in self.layers.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[{}", choice.op.id())?;
            for &skip in &choice.skips {
                write!(f, " {}", skip as usize)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_round_trip() {
        for op in OpKind::all() {
            assert_eq!(OpKind::from_id(op.id()).unwrap(), op);
        }
    }

    #[test]
    fn test_invalid_operator_id() {
        let err = OpKind::from_id(6).unwrap_err();
        assert!(matches!(err, EnasError::InvalidOperator { id: 6 }));
    }

    #[test]
    fn test_uniform_architecture_is_valid() {
        let arch = Architecture::uniform(OpKind::Conv3x3, 4);
        assert!(arch.validate(4).is_ok());
        assert_eq!(arch.num_layers(), 4);
        assert_eq!(arch.skip_rate(), 0.0);
    }

    #[test]
    fn test_wrong_skip_length_rejected() {
        let layers = vec![
            LayerChoice::new(OpKind::Conv3x3, vec![]),
            LayerChoice::new(OpKind::MaxPool3x3, vec![true, false]),
        ];
        let err = Architecture::new(layers).unwrap_err();
        assert!(matches!(err, EnasError::MalformedArchitecture { layer: 1, .. }));
    }

    #[test]
    fn test_wrong_layer_count_rejected() {
        let arch = Architecture::uniform(OpKind::Conv5x5, 3);
        assert!(arch.validate(4).is_err());
    }

    #[test]
    fn test_skip_rate() {
        let layers = vec![
            LayerChoice::new(OpKind::Conv3x3, vec![]),
            LayerChoice::new(OpKind::Conv3x3, vec![true]),
            LayerChoice::new(OpKind::Conv3x3, vec![true, false]),
        ];
        let arch = Architecture::new(layers).unwrap();
        // 2 of 3 possible skips taken
        assert!((arch.skip_rate() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_display_format() {
        let layers = vec![
            LayerChoice::new(OpKind::AvgPool3x3, vec![]),
            LayerChoice::new(OpKind::SepConv5x5, vec![true]),
        ];
        let arch = Architecture::new(layers).unwrap();
        assert_eq!(arch.to_string(), "[4]\n[3 1]");
    }

    #[test]
    fn test_json_round_trip() {
        let arch = Architecture::uniform(OpKind::SepConv3x3, 3);
        let json = arch.to_json().unwrap();
        let back = Architecture::from_json(&json).unwrap();
        assert_eq!(arch, back);
    }
}
