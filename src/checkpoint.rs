//! Checkpointing for long search runs
//!
//! Parameters go to safetensors files through the `VarMap`s; the scalar
//! search state travels in a JSON sidecar. Optimizer state is rebuilt from
//! scratch on resume.

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::arch::Architecture;
use crate::error::Result;
use crate::search::SearchConfig;

const SHARED_FILE: &str = "shared.safetensors";
const CONTROLLER_FILE: &str = "controller.safetensors";
const STATE_FILE: &str = "state.json";

/// Scalar state of an interrupted search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchState {
    /// Next epoch to run
    pub epoch: usize,
    /// EMA reward baseline, `None` until the first controller update
    pub baseline: Option<f64>,
    /// Best architecture seen so far
    pub best_arch: Option<Architecture>,
    /// Validation accuracy of `best_arch`
    pub best_valid_acc: f64,
    /// Configuration the run was started with; resuming under a different
    /// one is rejected instead of failing later as a shape error
    pub config: SearchConfig,
}

impl SearchState {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            epoch: 0,
            baseline: None,
            best_arch: None,
            best_valid_acc: 0.0,
            config,
        }
    }
}

/// Writes both parameter sets and the sidecar under `dir`
pub fn save(dir: &Path, shared: &VarMap, controller: &VarMap, state: &SearchState) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    shared.save(dir.join(SHARED_FILE))?;
    controller.save(dir.join(CONTROLLER_FILE))?;
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(dir.join(STATE_FILE), json)?;
    Ok(())
}

/// Loads a checkpoint back into already-constructed `VarMap`s. The networks
/// must have been built with the same configuration that produced the
/// checkpoint; mismatched shapes surface as tensor errors.
pub fn load(dir: &Path, shared: &mut VarMap, controller: &mut VarMap) -> Result<SearchState> {
    shared.load(dir.join(SHARED_FILE))?;
    controller.load(dir.join(CONTROLLER_FILE))?;
    let json = std::fs::read_to_string(dir.join(STATE_FILE))?;
    Ok(serde_json::from_str(&json)?)
}

pub fn exists(dir: &Path) -> bool {
    dir.join(SHARED_FILE).is_file()
        && dir.join(CONTROLLER_FILE).is_file()
        && dir.join(STATE_FILE).is_file()
}
