//! Running statistics helpers for the training loops

use candle_core::Tensor;

use crate::error::Result;

/// Running average over weighted scalar observations
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: f64,
    last: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.last = value;
        self.sum += value * weight;
        self.count += weight;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

/// Fraction of rows whose arg-max logit matches the label
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let predicted = logits.argmax(1)?.to_vec1::<u32>()?;
    let labels = labels.to_vec1::<u32>()?;
    let correct = predicted
        .iter()
        .zip(labels.iter())
        .filter(|(p, l)| p == l)
        .count();
    Ok(correct as f64 / labels.len().max(1) as f64)
}
