//! The alternating search loop
//!
//! Each epoch first trains the shared child weights on architectures drawn
//! from the (frozen) policy, then trains the policy by REINFORCE against
//! validation accuracy of the (frozen) child. Only one parameter set is
//! ever stepped per phase. Rewards enter the policy loss as plain scalars,
//! so no gradient can flow from the reward into the shared weights.

use candle_core::{DType, Device};
use candle_nn::loss::cross_entropy;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::arch::Architecture;
use crate::checkpoint::{self, SearchState};
use crate::cnn::network::{ChildConfig, FixedCnn, SharedCnn};
use crate::controller::{Controller, ControllerConfig};
use crate::data::BatchSource;
use crate::error::{EnasError, Result};
use crate::optim::{cosine_lr, Sgd, SgdConfig};
use crate::stats::{accuracy, AverageMeter};

/// Everything the search run needs, mirroring the original script's flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Batch interval for in-epoch progress logging
    pub log_every: usize,
    pub eval_every_epochs: usize,
    pub seed: u64,

    pub child: ChildConfig,
    pub child_lr_max: f64,
    pub child_lr_min: f64,
    /// Cosine warm-restart period, in epochs
    pub child_lr_t: usize,
    pub child_grad_bound: f64,
    pub child_l2_reg: f64,

    pub controller: ControllerConfig,
    pub controller_lr: f64,
    pub controller_entropy_weight: f64,
    pub controller_train_steps: usize,
    /// Rollouts aggregated into one policy update
    pub controller_num_aggregate: usize,
    pub controller_skip_weight: f64,
    /// EMA decay of the reward baseline
    pub controller_bl_dec: f64,

    /// Architectures sampled per evaluation round
    pub eval_num_samples: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_epochs: 310,
            batch_size: 128,
            log_every: 50,
            eval_every_epochs: 1,
            seed: 0,
            child: ChildConfig::default(),
            child_lr_max: 0.05,
            child_lr_min: 0.0005,
            child_lr_t: 10,
            child_grad_bound: 5.0,
            child_l2_reg: 0.00025,
            controller: ControllerConfig::default(),
            controller_lr: 0.001,
            controller_entropy_weight: 0.0001,
            controller_train_steps: 50,
            controller_num_aggregate: 20,
            controller_skip_weight: 0.8,
            controller_bl_dec: 0.99,
            eval_num_samples: 10,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        self.child.validate()?;
        self.controller.validate()?;
        if self.child.num_layers != self.controller.num_layers {
            return Err(EnasError::Config(format!(
                "child has {} layers but the controller samples {}",
                self.child.num_layers, self.controller.num_layers
            )));
        }
        if !(0.0..1.0).contains(&self.controller_bl_dec) {
            return Err(EnasError::Config(format!(
                "controller_bl_dec must be in [0, 1), got {}",
                self.controller_bl_dec
            )));
        }
        if self.controller_train_steps == 0 || self.controller_num_aggregate == 0 {
            return Err(EnasError::Config(
                "controller_train_steps and controller_num_aggregate must be positive".into(),
            ));
        }
        if self.child_lr_t == 0 {
            return Err(EnasError::Config("child_lr_t must be positive".into()));
        }
        Ok(())
    }

    fn child_sgd(&self) -> SgdConfig {
        SgdConfig {
            lr: self.child_lr_max,
            momentum: 0.9,
            nesterov: true,
            weight_decay: self.child_l2_reg,
            grad_bound: Some(self.child_grad_bound),
        }
    }

    fn controller_adam(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.controller_lr,
            beta1: 0.0,
            beta2: 0.999,
            eps: 1e-3,
            weight_decay: 0.0,
        }
    }
}

/// Receives one scalar summary per phase; keeps the loop free of any
/// hard-wired reporting backend
pub trait EpochSink {
    fn on_child_epoch(&mut self, epoch: usize, loss: f64, acc: f64, lr: f64);
    fn on_controller_epoch(&mut self, epoch: usize, reward: f64, baseline: f64, entropy: f64);
    fn on_eval(&mut self, epoch: usize, arch: &Architecture, valid_acc: f64, test_acc: f64);
}

/// Default sink that forwards everything to `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EpochSink for TracingSink {
    fn on_child_epoch(&mut self, epoch: usize, loss: f64, acc: f64, lr: f64) {
        info!(epoch, loss, acc, lr, "child epoch done");
    }

    fn on_controller_epoch(&mut self, epoch: usize, reward: f64, baseline: f64, entropy: f64) {
        info!(epoch, reward, baseline, entropy, "controller epoch done");
    }

    fn on_eval(&mut self, epoch: usize, arch: &Architecture, valid_acc: f64, test_acc: f64) {
        info!(epoch, valid_acc, test_acc, "evaluation done");
        for line in arch.to_string().lines() {
            info!("  {line}");
        }
    }
}

/// Owns the two networks, their optimizers and the reward baseline for one
/// search run
pub struct SearchTask {
    cfg: SearchConfig,
    shared_vars: VarMap,
    controller_vars: VarMap,
    shared: SharedCnn,
    controller: Controller,
    child_opt: Sgd,
    controller_opt: AdamW,
    state: SearchState,
}

impl std::fmt::Debug for SearchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchTask")
            .field("cfg", &self.cfg)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SearchTask {
    pub fn new(cfg: SearchConfig, device: &Device) -> Result<Self> {
        cfg.validate()?;

        let shared_vars = VarMap::new();
        let shared_vb = VarBuilder::from_varmap(&shared_vars, DType::F32, device);
        let shared = SharedCnn::new(&cfg.child, shared_vb)?;

        let controller_vars = VarMap::new();
        let controller_vb = VarBuilder::from_varmap(&controller_vars, DType::F32, device);
        let mut controller_cfg = cfg.controller.clone();
        controller_cfg.seed = cfg.seed;
        let controller = Controller::new(controller_cfg, controller_vb)?;

        let child_opt = Sgd::new(shared_vars.all_vars(), cfg.child_sgd())?;
        let controller_opt = AdamW::new(controller_vars.all_vars(), cfg.controller_adam())?;

        let state = SearchState::new(cfg.clone());
        Ok(Self {
            cfg,
            shared_vars,
            controller_vars,
            shared,
            controller,
            child_opt,
            controller_opt,
            state,
        })
    }

    /// Rebuilds a task from a checkpoint directory. The checkpoint must
    /// have been produced with the same configuration; optimizer velocity
    /// and moment estimates restart cold.
    pub fn resume(cfg: SearchConfig, device: &Device, dir: &Path) -> Result<Self> {
        let mut task = Self::new(cfg, device)?;
        let state = checkpoint::load(dir, &mut task.shared_vars, &mut task.controller_vars)?;
        if state.config != task.cfg {
            return Err(EnasError::Config(
                "checkpoint was produced with a different configuration".into(),
            ));
        }
        task.state = state;
        info!(epoch = task.state.epoch, "resumed search from checkpoint");
        Ok(task)
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    /// Runs the remaining epochs and returns the best architecture found
    pub fn run(
        &mut self,
        train: &mut dyn BatchSource,
        valid: &mut dyn BatchSource,
        test: &mut dyn BatchSource,
        sink: &mut dyn EpochSink,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Architecture> {
        while self.state.epoch < self.cfg.num_epochs {
            let epoch = self.state.epoch;
            self.child_epoch(epoch, train, sink)?;
            self.controller_epoch(epoch, valid, sink)?;
            if (epoch + 1) % self.cfg.eval_every_epochs == 0 {
                self.evaluate(epoch, valid, test, sink)?;
            }
            self.state.epoch += 1;
            if let Some(dir) = checkpoint_dir {
                checkpoint::save(dir, &self.shared_vars, &self.controller_vars, &self.state)?;
            }
        }
        self.state
            .best_arch
            .clone()
            .ok_or_else(|| EnasError::Config("search finished without an evaluation round".into()))
    }

    /// Child phase: SGD on the shared weights, architectures sampled fresh
    /// per batch with their policy tensors dropped
    fn child_epoch(
        &mut self,
        epoch: usize,
        train: &mut dyn BatchSource,
        sink: &mut dyn EpochSink,
    ) -> Result<()> {
        let lr = cosine_lr(epoch, self.cfg.child_lr_max, self.cfg.child_lr_min, self.cfg.child_lr_t);
        self.child_opt.set_lr(lr);

        let mut loss_meter = AverageMeter::new();
        let mut acc_meter = AverageMeter::new();
        train.reset();
        for i in 0..train.num_batches() {
            let rollout = self.controller.sample()?;
            let batch = train.next_batch()?;
            let logits = self.shared.forward(&batch.images, &rollout.arch, true)?;
            let loss = cross_entropy(&logits, &batch.labels)?;
            let grads = loss.backward()?;
            self.child_opt.step(&grads)?;

            loss_meter.update(loss.to_scalar::<f32>()? as f64, batch.len() as f64);
            acc_meter.update(accuracy(&logits.detach(), &batch.labels)?, batch.len() as f64);
            if (i + 1) % self.cfg.log_every == 0 {
                debug!(
                    epoch,
                    batch = i + 1,
                    loss = loss_meter.avg(),
                    acc = acc_meter.avg(),
                    "child progress"
                );
            }
        }
        sink.on_child_epoch(epoch, loss_meter.avg(), acc_meter.avg(), lr);
        Ok(())
    }

    /// Controller phase: REINFORCE against validation accuracy of the
    /// frozen child, `num_aggregate` rollouts per update
    fn controller_epoch(
        &mut self,
        epoch: usize,
        valid: &mut dyn BatchSource,
        sink: &mut dyn EpochSink,
    ) -> Result<()> {
        let mut reward_meter = AverageMeter::new();
        let mut entropy_meter = AverageMeter::new();
        for step in 0..self.cfg.controller_train_steps {
            let mut total_loss = None;
            for _ in 0..self.cfg.controller_num_aggregate {
                let rollout = self.controller.sample()?;
                let batch = valid.next_batch()?;
                let logits = self.shared.evaluate(&batch.images, &rollout.arch)?.detach();
                let acc = accuracy(&logits, &batch.labels)?;
                let entropy = rollout.entropy.to_scalar::<f32>()? as f64;

                let reward = acc + self.cfg.controller_entropy_weight * entropy
                    - self.cfg.controller_skip_weight * rollout.skip_penalty;
                let baseline = match self.state.baseline {
                    None => reward,
                    Some(b) => b - (1.0 - self.cfg.controller_bl_dec) * (b - reward),
                };
                self.state.baseline = Some(baseline);

                let loss = (rollout.log_prob * (reward - baseline))?.neg()?;
                total_loss = Some(match total_loss {
                    None => loss,
                    Some(acc_loss) => (acc_loss + loss)?,
                });
                reward_meter.update(reward, 1.0);
                entropy_meter.update(entropy, 1.0);
            }
            if let Some(loss) = total_loss {
                self.controller_opt.backward_step(&loss)?;
            }
            if (step + 1) % self.cfg.log_every == 0 {
                debug!(
                    epoch,
                    step = step + 1,
                    reward = reward_meter.avg(),
                    baseline = self.state.baseline,
                    "controller progress"
                );
            }
        }
        let baseline = self.state.baseline.unwrap_or_default();
        sink.on_controller_epoch(epoch, reward_meter.avg(), baseline, entropy_meter.avg());
        Ok(())
    }

    /// Samples architectures from the current policy and scores each one
    /// on a single validation batch
    pub fn sample_candidates(
        &mut self,
        valid: &mut dyn BatchSource,
        count: usize,
    ) -> Result<Vec<(Architecture, f64)>> {
        let probe = valid.next_batch()?;
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            let rollout = self.controller.sample()?;
            let logits = self.shared.evaluate(&probe.images, &rollout.arch)?;
            let acc = accuracy(&logits, &probe.labels)?;
            candidates.push((rollout.arch, acc));
        }
        Ok(candidates)
    }

    /// Samples candidates, keeps the one with the best single-batch
    /// validation accuracy and reports its full validation/test accuracy
    fn evaluate(
        &mut self,
        epoch: usize,
        valid: &mut dyn BatchSource,
        test: &mut dyn BatchSource,
        sink: &mut dyn EpochSink,
    ) -> Result<()> {
        let mut best: Option<(Architecture, f64)> = None;
        for (arch, acc) in self.sample_candidates(valid, self.cfg.eval_num_samples)? {
            if best.as_ref().map_or(true, |(_, b)| acc > *b) {
                best = Some((arch, acc));
            }
        }
        let (arch, _) = best.ok_or_else(|| {
            EnasError::Config("eval_num_samples must be positive".into())
        })?;

        let valid_acc = self.full_accuracy(valid, &arch)?;
        let test_acc = self.full_accuracy(test, &arch)?;
        if valid_acc >= self.state.best_valid_acc {
            self.state.best_valid_acc = valid_acc;
            self.state.best_arch = Some(arch.clone());
        }
        sink.on_eval(epoch, &arch, valid_acc, test_acc);
        Ok(())
    }

    fn full_accuracy(&self, source: &mut dyn BatchSource, arch: &Architecture) -> Result<f64> {
        let mut meter = AverageMeter::new();
        source.reset();
        for _ in 0..source.num_batches() {
            let batch = source.next_batch()?;
            let logits = self.shared.evaluate(&batch.images, arch)?;
            meter.update(accuracy(&logits, &batch.labels)?, batch.len() as f64);
        }
        Ok(meter.avg())
    }
}

/// Trains a dedicated network for one finalized architecture and returns
/// its final test accuracy
pub fn train_fixed(
    cfg: &SearchConfig,
    arch: &Architecture,
    train: &mut dyn BatchSource,
    test: &mut dyn BatchSource,
    device: &Device,
    sink: &mut dyn EpochSink,
) -> Result<f64> {
    cfg.validate()?;
    arch.validate(cfg.child.num_layers)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let net = FixedCnn::new(&cfg.child, arch, vb)?;
    let mut opt = Sgd::new(varmap.all_vars(), cfg.child_sgd())?;

    for epoch in 0..cfg.num_epochs {
        let lr = cosine_lr(epoch, cfg.child_lr_max, cfg.child_lr_min, cfg.child_lr_t);
        opt.set_lr(lr);
        let mut loss_meter = AverageMeter::new();
        let mut acc_meter = AverageMeter::new();
        train.reset();
        for _ in 0..train.num_batches() {
            let batch = train.next_batch()?;
            let logits = net.forward(&batch.images, true)?;
            let loss = cross_entropy(&logits, &batch.labels)?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
            loss_meter.update(loss.to_scalar::<f32>()? as f64, batch.len() as f64);
            acc_meter.update(accuracy(&logits.detach(), &batch.labels)?, batch.len() as f64);
        }
        sink.on_child_epoch(epoch, loss_meter.avg(), acc_meter.avg(), lr);
    }

    let mut meter = AverageMeter::new();
    test.reset();
    for _ in 0..test.num_batches() {
        let batch = test.next_batch()?;
        let logits = net.forward(&batch.images, false)?;
        meter.update(accuracy(&logits, &batch.labels)?, batch.len() as f64);
    }
    let test_acc = meter.avg();
    sink.on_eval(cfg.num_epochs.saturating_sub(1), arch, 0.0, test_acc);
    Ok(test_acc)
}
