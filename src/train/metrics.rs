//! Running binary-classification metrics and per-epoch history.

use serde::{Deserialize, Serialize};

const DECISION: f32 = 0.5;

/// Confusion counts plus a sample-weighted loss sum.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BinaryCounts {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
    loss_sum: f64,
}

impl BinaryCounts {
    /// `probs` and `targets` are per-sample; `batch_loss` is the batch mean.
    pub fn update(&mut self, probs: &[f32], targets: &[f32], batch_loss: f64) {
        debug_assert_eq!(probs.len(), targets.len());
        for (&p, &t) in probs.iter().zip(targets) {
            // a prediction of exactly 0.5 counts as negative
            match (p > DECISION, t >= DECISION) {
                (true, true) => self.tp += 1,
                (true, false) => self.fp += 1,
                (false, false) => self.tn += 1,
                (false, true) => self.fn_ += 1,
            }
        }
        self.loss_sum += batch_loss * probs.len() as f64;
    }

    pub fn seen(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn loss(&self) -> f64 {
        ratio(self.loss_sum, self.seen() as f64)
    }

    pub fn accuracy(&self) -> f64 {
        ratio((self.tp + self.tn) as f64, self.seen() as f64)
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp as f64, (self.tp + self.fp) as f64)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp as f64, (self.tp + self.fn_) as f64)
    }

    pub fn summary(&self) -> EpochMetrics {
        EpochMetrics {
            loss: self.loss(),
            accuracy: self.accuracy(),
            precision: self.precision(),
            recall: self.recall(),
        }
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: String,
    /// 1-based within the phase.
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: EpochMetrics,
    pub valid: EpochMetrics,
}

/// Training curves of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn phase(&self, name: &str) -> impl Iterator<Item = &EpochRecord> {
        let name = name.to_string();
        self.epochs.iter().filter(move |r| r.phase == name)
    }

    pub fn series(&self, f: impl Fn(&EpochRecord) -> f64) -> Vec<f64> {
        self.epochs.iter().map(f).collect()
    }
}
