//! Autoregressive LSTM policy that samples architectures
//!
//! The controller emits one operator token per layer and, for every later
//! layer, one Bernoulli decision per prior layer via an attention mechanism
//! over the stored hidden states. Log-probabilities and entropies of all
//! decisions are accumulated as graph-retained scalars so a REINFORCE loss
//! can be formed directly from a [`Rollout`].

use candle_core::{DType, IndexOp, Module, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::rnn::LSTMState;
use candle_nn::{embedding, linear_no_bias, lstm, Embedding, Init, Linear, LSTMConfig, RNN, LSTM, VarBuilder};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::arch::{Architecture, LayerChoice, OpKind, NUM_BRANCHES};
use crate::error::{EnasError, Result};

/// Controller hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub num_layers: usize,
    pub num_branches: usize,
    pub lstm_size: usize,
    pub lstm_num_layers: usize,
    /// Bound on the decision logits, `c * tanh(logit)`
    pub tanh_constant: f64,
    /// Extra divisor applied to the operator-logit bound
    pub op_tanh_reduce: f64,
    /// Optional softmax temperature on the operator logits
    pub temperature: Option<f64>,
    /// Desired fraction of skip connections
    pub skip_target: f64,
    pub seed: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            num_layers: 12,
            num_branches: NUM_BRANCHES,
            lstm_size: 64,
            lstm_num_layers: 1,
            tanh_constant: 1.5,
            op_tanh_reduce: 2.5,
            temperature: None,
            skip_target: 0.4,
            seed: 42,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_branches != NUM_BRANCHES {
            return Err(EnasError::Config(format!(
                "the child network defines {NUM_BRANCHES} branches, got num_branches = {}",
                self.num_branches
            )));
        }
        if self.lstm_size == 0 || self.lstm_num_layers == 0 {
            return Err(EnasError::Config(
                "lstm_size and lstm_num_layers must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.skip_target) {
            return Err(EnasError::Config(format!(
                "skip_target must be in [0, 1], got {}",
                self.skip_target
            )));
        }
        Ok(())
    }
}

/// One sampled architecture with the tensors needed for its policy update
#[derive(Debug)]
pub struct Rollout {
    pub arch: Architecture,
    /// Sum of the log-probabilities of every decision, graph-retained
    pub log_prob: Tensor,
    /// Sum of the decision entropies, non-negative
    pub entropy: Tensor,
    /// `|realized skip rate - skip_target|`, zero exactly at the target
    pub skip_penalty: f64,
}

#[derive(Debug)]
pub struct Controller {
    cfg: ControllerConfig,
    cells: Vec<LSTM>,
    op_embedding: Embedding,
    /// Learned input for the first step
    start_token: Tensor,
    op_head: Linear,
    attn_prev: Linear,
    attn_curr: Linear,
    attn_v: Linear,
    rng: Xoshiro256PlusPlus,
}

impl Controller {
    pub fn new(cfg: ControllerConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let n = cfg.lstm_size;
        let cells = (0..cfg.lstm_num_layers)
            .map(|i| lstm(n, n, LSTMConfig::default(), vb.pp(format!("lstm_{i}"))))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let op_embedding = embedding(cfg.num_branches, n, vb.pp("op_embedding"))?;
        let start_token = vb.get_with_hints(
            (1, n),
            "start_token",
            Init::Randn {
                mean: 0.0,
                stdev: 0.1,
            },
        )?;
        let op_head = linear_no_bias(n, cfg.num_branches, vb.pp("op_head"))?;
        let attn_prev = linear_no_bias(n, n, vb.pp("attn_prev"))?;
        let attn_curr = linear_no_bias(n, n, vb.pp("attn_curr"))?;
        let attn_v = linear_no_bias(n, 1, vb.pp("attn_v"))?;
        let rng = Xoshiro256PlusPlus::seed_from_u64(cfg.seed);
        Ok(Self {
            cfg,
            cells,
            op_embedding,
            start_token,
            op_head,
            attn_prev,
            attn_curr,
            attn_v,
            rng,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    /// Sample a fresh architecture from the current policy
    pub fn sample(&mut self) -> Result<Rollout> {
        self.walk(None)
    }

    /// Log-probability the current policy assigns to a fixed descriptor
    pub fn log_prob_of(&mut self, arch: &Architecture) -> Result<Rollout> {
        arch.validate(self.cfg.num_layers)?;
        self.walk(Some(arch))
    }

    fn lstm_step(&self, input: &Tensor, states: &mut [LSTMState]) -> Result<Tensor> {
        let mut x = input.clone();
        for (cell, state) in self.cells.iter().zip(states.iter_mut()) {
            *state = cell.step(&x, state)?;
            x = state.h().clone();
        }
        Ok(x)
    }

    /// Runs the full decision recurrence. With `forced` the decisions are
    /// read from the descriptor instead of sampled, which re-scores it under
    /// the current parameters; the RNG is untouched on that path.
    fn walk(&mut self, forced: Option<&Architecture>) -> Result<Rollout> {
        let device = self.start_token.device().clone();
        let mut states = self
            .cells
            .iter()
            .map(|c| c.zero_state(1))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut input = self.start_token.clone();
        // attention keys of all prior hidden states, projected once
        let mut anchors: Vec<Tensor> = Vec::with_capacity(self.cfg.num_layers);

        let mut log_prob = Tensor::zeros((), DType::F32, &device)?;
        let mut entropy = Tensor::zeros((), DType::F32, &device)?;
        let mut layers = Vec::with_capacity(self.cfg.num_layers);
        let mut skips_taken = 0usize;
        let mut skips_possible = 0usize;

        for layer_id in 0..self.cfg.num_layers {
            let h = self.lstm_step(&input, &mut states)?;

            let mut logits = self.op_head.forward(&h)?.squeeze(0)?;
            if let Some(t) = self.cfg.temperature {
                logits = (logits / t)?;
            }
            let logits = (logits.tanh()? * (self.cfg.tanh_constant / self.cfg.op_tanh_reduce))?;
            let log_p = log_softmax(&logits, D::Minus1)?;
            let op_id = match forced {
                Some(arch) => arch.layers()[layer_id].op.id(),
                None => self.sample_categorical(&log_p)?,
            };
            log_prob = (log_prob + log_p.i(op_id)?)?;
            entropy = (entropy + entropy_of(&log_p)?)?;
            let op = OpKind::from_id(op_id)?;

            let mut skips = Vec::with_capacity(layer_id);
            if layer_id > 0 {
                let keys = Tensor::cat(&anchors.iter().collect::<Vec<_>>(), 0)?;
                let query = keys.broadcast_add(&self.attn_curr.forward(&h)?)?.tanh()?;
                let scores = self.attn_v.forward(&query)?.squeeze(1)?;
                let scores = (scores.tanh()? * self.cfg.tanh_constant)?;
                for i in 0..layer_id {
                    let s = scores.i(i)?;
                    let pair = Tensor::stack(&[&s.neg()?, &s], 0)?;
                    let log_p = log_softmax(&pair, D::Minus1)?;
                    let take = match forced {
                        Some(arch) => arch.layers()[layer_id].skips[i],
                        None => self.sample_categorical(&log_p)? == 1,
                    };
                    log_prob = (log_prob + log_p.i(take as usize)?)?;
                    entropy = (entropy + entropy_of(&log_p)?)?;
                    skips_taken += take as usize;
                    skips.push(take);
                }
                skips_possible += layer_id;
            }

            anchors.push(self.attn_prev.forward(&h)?);
            let token = Tensor::new(&[op_id as u32], &device)?;
            input = self.op_embedding.forward(&token)?;
            layers.push(LayerChoice::new(op, skips));
        }

        let arch = Architecture::new(layers)?;
        let skip_rate = if skips_possible == 0 {
            0.0
        } else {
            skips_taken as f64 / skips_possible as f64
        };
        Ok(Rollout {
            arch,
            log_prob,
            entropy,
            skip_penalty: (skip_rate - self.cfg.skip_target).abs(),
        })
    }

    fn sample_categorical(&mut self, log_p: &Tensor) -> Result<usize> {
        let probs = log_p.exp()?.to_vec1::<f32>()?;
        let draw: f64 = self.rng.gen();
        let mut acc = 0.0f64;
        for (i, p) in probs.iter().enumerate() {
            acc += *p as f64;
            if draw < acc {
                return Ok(i);
            }
        }
        Ok(probs.len() - 1)
    }
}

fn entropy_of(log_p: &Tensor) -> Result<Tensor> {
    Ok((log_p.exp()? * log_p)?.sum_all()?.neg()?)
}
