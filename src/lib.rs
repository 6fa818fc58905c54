//! Efficient neural architecture search with weight sharing
//!
//! A controller RNN samples convolutional architectures from a macro
//! search space; every sampled architecture is a sub-network of one
//! weight-shared child model, so candidates are scored without training
//! from scratch. The controller is trained by REINFORCE against the
//! child's validation accuracy.
//!
//! # Modules
//!
//! ## Search core
//! - [`arch`] - Architecture descriptors (operators and skip connections)
//! - [`cnn`] - Child networks: candidate branches, shared and fixed models
//! - [`controller`] - Autoregressive LSTM policy
//! - [`search`] - Alternating child/controller training loop
//!
//! ## Infrastructure
//! - [`data`] - CIFAR-10 binary loader and synthetic batch sources
//! - [`optim`] - Momentum SGD with gradient clipping, cosine schedule
//! - [`checkpoint`] - safetensors parameters plus JSON search state
//! - [`stats`] - Running averages and accuracy
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Search core
pub mod arch;
pub mod cnn;
pub mod controller;
pub mod search;

// Infrastructure
pub mod checkpoint;
pub mod data;
pub mod optim;
pub mod stats;

// Services
pub mod cli;

pub use error::{EnasError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{EnasError, Result};

    // Descriptors
    pub use crate::arch::{Architecture, LayerChoice, OpKind, NUM_BRANCHES};

    // Child networks
    pub use crate::cnn::{ChildConfig, FixedCnn, SharedCnn};

    // Policy
    pub use crate::controller::{Controller, ControllerConfig, Rollout};

    // Search loop
    pub use crate::search::{EpochSink, SearchConfig, SearchTask, TracingSink};

    // Data
    pub use crate::data::{Batch, BatchSource, CifarDataset, SyntheticDataset};
}
