use serde::Serialize;

use crate::loss::LossMetrics;

/// Per-epoch accumulator, rebuilt at the start of every epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub average_loss: f64,
    pub accuracy: f64,
    pub batches: usize,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metrics: &LossMetrics) {
        self.loss_sum += metrics.average_loss() as f64;
        self.batches += 1;
        self.correct += metrics.correct_tokens();
        self.total += metrics.total_tokens();
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn running_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    pub fn summary(&self, epoch: usize) -> EpochSummary {
        let accuracy = if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        };
        EpochSummary {
            epoch,
            average_loss: self.running_loss(),
            accuracy,
            batches: self.batches,
        }
    }
}
