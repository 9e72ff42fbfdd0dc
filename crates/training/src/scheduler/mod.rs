use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Steps between warm restarts of the cosine schedule.
pub const WARM_RESTART_PERIOD: usize = 20;

pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Cosine annealing from `base_lr` down to `eta_min`, restarting every
/// `t_i` steps. The period is multiplied by `t_mult` at each restart.
#[derive(Debug, Clone)]
pub struct CosineWarmRestarts {
    base_lr: f64,
    eta_min: f64,
    t_0: usize,
    t_mult: usize,
    t_i: usize,
    t_cur: usize,
    steps: usize,
    current_lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_lr: f64,
    pub eta_min: f64,
    pub t_0: usize,
    pub t_mult: usize,
    pub t_i: usize,
    pub t_cur: usize,
    pub steps: usize,
    pub learning_rate: f64,
}

impl CosineWarmRestarts {
    pub fn new(base_lr: f64) -> Result<Self, TrainingError> {
        Self::with_period(base_lr, WARM_RESTART_PERIOD, 1, 0.0)
    }

    pub fn with_period(
        base_lr: f64,
        t_0: usize,
        t_mult: usize,
        eta_min: f64,
    ) -> Result<Self, TrainingError> {
        if !(base_lr.is_finite() && base_lr > 0.0) {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if t_0 == 0 {
            return Err(TrainingError::initialization(
                "scheduler restart period must be positive",
            ));
        }
        if t_mult == 0 {
            return Err(TrainingError::initialization(
                "scheduler period multiplier must be at least 1",
            ));
        }
        if !(0.0..=base_lr).contains(&eta_min) {
            return Err(TrainingError::initialization(
                "scheduler eta_min must be in [0, base_lr]",
            ));
        }
        Ok(Self {
            base_lr,
            eta_min,
            t_0,
            t_mult,
            t_i: t_0,
            t_cur: 0,
            steps: 0,
            current_lr: base_lr,
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    fn compute_lr(&self) -> f64 {
        let progress = self.t_cur as f64 / self.t_i as f64;
        self.eta_min + (self.base_lr - self.eta_min) * 0.5 * (1.0 + f64::cos(PI * progress))
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            base_lr: self.base_lr,
            eta_min: self.eta_min,
            t_0: self.t_0,
            t_mult: self.t_mult,
            t_i: self.t_i,
            t_cur: self.t_cur,
            steps: self.steps,
            learning_rate: self.current_lr,
        }
    }

    pub fn load_state(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.t_0 == 0 || state.t_i == 0 || state.t_mult == 0 || state.t_cur >= state.t_i {
            return Err(TrainingError::runtime(format!(
                "scheduler state is inconsistent: t_0={} t_i={} t_mult={} t_cur={}",
                state.t_0, state.t_i, state.t_mult, state.t_cur
            )));
        }
        if !(state.base_lr.is_finite() && state.learning_rate.is_finite()) {
            return Err(TrainingError::runtime(
                "scheduler state has a non-finite learning rate",
            ));
        }
        *self = Self {
            base_lr: state.base_lr,
            eta_min: state.eta_min,
            t_0: state.t_0,
            t_mult: state.t_mult,
            t_i: state.t_i,
            t_cur: state.t_cur,
            steps: state.steps,
            current_lr: state.learning_rate,
        };
        Ok(())
    }
}

impl LRScheduler for CosineWarmRestarts {
    fn step(&mut self) -> f64 {
        self.steps = self.steps.saturating_add(1);
        self.t_cur += 1;
        if self.t_cur >= self.t_i {
            self.t_cur -= self.t_i;
            self.t_i = self.t_i.saturating_mul(self.t_mult);
        }
        self.current_lr = self.compute_lr();
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
