//! Child network components: candidate branches, layers and full models

pub mod branches;
pub mod layer;
pub mod network;

pub use branches::{instance_norm, BranchOp, ConvBranch, FactorizedReduction, PoolBranch, SeparableConv};
pub use layer::{FixedLayer, SharedLayer};
pub use network::{ChildConfig, FixedCnn, SharedCnn};
