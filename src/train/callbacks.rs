//! Epoch-end policies: early stopping, plateau decay, best checkpoint.
//!
//! Pure state machines over monitored values so each can be tested
//! without a model.

/// What early stopping decided after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    /// New best value; snapshot the weights.
    Improved,
    Waiting,
    /// Patience exhausted; restore the snapshot and stop.
    Stop,
}

/// Stops when validation loss has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    wait: usize,
    best_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self { patience, best: f64::INFINITY, wait: 0, best_epoch: None }
    }

    pub fn update(&mut self, epoch: usize, val_loss: f64) -> Monitor {
        if val_loss < self.best {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return Monitor::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            Monitor::Stop
        } else {
            Monitor::Waiting
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs in which
/// validation loss did not drop by more than `min_delta`, never going below
/// `min_lr`.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    patience: usize,
    factor: f64,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(patience: usize, factor: f64, min_lr: f64, min_delta: f64) -> Self {
        Self { patience, factor, min_lr, min_delta, best: f64::INFINITY, wait: 0 }
    }

    /// Returns the new learning rate when it changes.
    pub fn update(&mut self, val_loss: f64, lr: f64) -> Option<f64> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;
        if lr <= self.min_lr {
            return None;
        }
        Some((lr * self.factor).max(self.min_lr))
    }
}

/// Tracks the best validation accuracy across the whole run.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    best: f64,
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self { best: f64::NEG_INFINITY }
    }
}

impl BestCheckpoint {
    /// True when `val_accuracy` beats every earlier value.
    pub fn improved(&mut self, val_accuracy: f64) -> bool {
        if val_accuracy > self.best {
            self.best = val_accuracy;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best.is_finite().then_some(self.best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut es = EarlyStopping::new(5);
        assert_eq!(es.update(1, 1.0), Monitor::Improved);
        assert_eq!(es.update(2, 0.8), Monitor::Improved);
        for epoch in 3..7 {
            assert_eq!(es.update(epoch, 0.9), Monitor::Waiting, "epoch {epoch}");
        }
        assert_eq!(es.update(7, 0.8), Monitor::Stop);
        assert_eq!(es.best_epoch(), Some(2));
    }

    #[test]
    fn early_stopping_counter_resets_on_improvement() {
        let mut es = EarlyStopping::new(2);
        es.update(1, 1.0);
        assert_eq!(es.update(2, 1.1), Monitor::Waiting);
        assert_eq!(es.update(3, 0.5), Monitor::Improved);
        assert_eq!(es.update(4, 0.6), Monitor::Waiting);
        assert_eq!(es.update(5, 0.6), Monitor::Stop);
        assert_eq!(es.best_epoch(), Some(3));
    }

    #[test]
    fn plateau_halves_after_three_flat_epochs() {
        let mut p = ReduceLrOnPlateau::new(3, 0.5, 1e-7, 1e-4);
        let lr = 1e-3;
        assert_eq!(p.update(1.0, lr), None);
        assert_eq!(p.update(1.0, lr), None);
        assert_eq!(p.update(1.2, lr), None);
        assert_eq!(p.update(1.1, lr), Some(5e-4));
        // counter restarts after a reduction
        assert_eq!(p.update(1.1, 5e-4), None);
        assert_eq!(p.update(1.1, 5e-4), None);
        assert_eq!(p.update(1.1, 5e-4), Some(2.5e-4));
    }

    #[test]
    fn plateau_respects_floor() {
        let mut p = ReduceLrOnPlateau::new(1, 0.5, 1e-7, 1e-4);
        p.update(1.0, 1.5e-7);
        assert_eq!(p.update(1.0, 1.5e-7), Some(1e-7));
        assert_eq!(p.update(1.0, 1e-7), None);
    }

    #[test]
    fn plateau_ignores_gains_below_min_delta() {
        let mut p = ReduceLrOnPlateau::new(2, 0.5, 1e-7, 1e-4);
        assert_eq!(p.update(0.5, 1e-3), None);
        assert_eq!(p.update(0.49995, 1e-3), None);
        assert_eq!(p.update(0.49991, 1e-3), Some(5e-4));
        // a real drop resets the counter
        assert_eq!(p.update(0.4, 5e-4), None);
        assert_eq!(p.update(0.39999, 5e-4), None);
        assert_eq!(p.update(0.3, 5e-4), None);
    }

    #[test]
    fn checkpoint_only_on_strict_gain() {
        let mut c = BestCheckpoint::default();
        assert_eq!(c.best(), None);
        assert!(c.improved(0.5));
        assert!(!c.improved(0.5));
        assert!(c.improved(0.75));
        assert!(!c.improved(0.6));
        assert_eq!(c.best(), Some(0.75));
    }
}
