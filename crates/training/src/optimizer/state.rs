use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use super::{
    AdamConfig, GradientScalerState, OptimizerState, PrecisionPolicy, StepOutcome,
    TrainerOptimizer,
};
use crate::{
    context::TrainingContext,
    distributed::ReplicatedModel,
    model::Seq2SeqModel,
    scheduler::{CosineWarmRestarts, LRScheduler, SchedulerState},
    TrainingError,
};

/// Optimizer, learning-rate schedule and precision policy, stepped and
/// persisted together.
pub struct OptimizationState {
    optimizer: TrainerOptimizer,
    scheduler: CosineWarmRestarts,
    precision: PrecisionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSnapshot {
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    /// Absent when the run did not scale its loss.
    pub scaler: Option<GradientScalerState>,
}

impl OptimizationState {
    pub fn new(
        parameters: Vec<(String, Var)>,
        learning_rate: f64,
        weight_decay: f64,
        ctx: &TrainingContext,
    ) -> Result<Self, TrainingError> {
        let optimizer = TrainerOptimizer::new(parameters, AdamConfig::new(learning_rate, weight_decay))?;
        let scheduler = CosineWarmRestarts::new(learning_rate)?;
        Ok(Self::from_parts(
            optimizer,
            scheduler,
            PrecisionPolicy::for_context(ctx),
        ))
    }

    pub fn from_parts(
        optimizer: TrainerOptimizer,
        scheduler: CosineWarmRestarts,
        precision: PrecisionPolicy,
    ) -> Self {
        Self {
            optimizer,
            scheduler,
            precision,
        }
    }

    /// Backward, update, clear gradients, then advance the schedule by one
    /// step. The schedule advances even when the update was skipped.
    pub fn step<M: Seq2SeqModel>(
        &mut self,
        loss: &Tensor,
        model: &ReplicatedModel<M>,
    ) -> Result<StepOutcome, TrainingError> {
        let mut grads = self.precision.backward(loss, model)?;
        let outcome = self.precision.step(&mut grads, &mut self.optimizer)?;
        self.optimizer.zero_grad(&mut grads);

        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        Ok(outcome)
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &CosineWarmRestarts {
        &self.scheduler
    }

    pub fn precision(&self) -> &PrecisionPolicy {
        &self.precision
    }

    pub fn snapshot(&self) -> Result<OptimizationSnapshot, TrainingError> {
        Ok(OptimizationSnapshot {
            optimizer: self.optimizer.state()?,
            scheduler: self.scheduler.state(),
            scaler: self.precision.state(),
        })
    }

    pub fn restore(&mut self, snapshot: OptimizationSnapshot) -> Result<(), TrainingError> {
        self.scheduler.load_state(&snapshot.scheduler)?;
        self.precision.load_state(snapshot.scaler.as_ref())?;
        self.optimizer.load_state(snapshot.optimizer)?;
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::{
        context::WorkerRole,
        masks::MaskSet,
        optimizer::{GradientScaler, LossScaleConfig},
        scheduler::WARM_RESTART_PERIOD,
    };

    struct Scalar {
        weight: Var,
    }

    impl Scalar {
        fn new(value: f32) -> Self {
            Self {
                weight: Var::new(&[value], &Device::Cpu).unwrap(),
            }
        }

        fn value(&self) -> f32 {
            self.weight.as_tensor().to_vec1::<f32>().unwrap()[0]
        }

        fn loss(&self, slope: f64) -> Tensor {
            self.weight
                .as_tensor()
                .affine(slope, 0.0)
                .unwrap()
                .sum_all()
                .unwrap()
        }
    }

    impl Seq2SeqModel for Scalar {
        fn forward(
            &self,
            _prompt: &Tensor,
            _decoder_input: &Tensor,
            _masks: &MaskSet,
            _compute_dtype: DType,
        ) -> candle_core::Result<Tensor> {
            Ok(self.weight.as_tensor().clone())
        }

        fn parameters(&self) -> Vec<(String, Var)> {
            vec![("weight".to_string(), self.weight.clone())]
        }
    }

    fn state_for(model: &ReplicatedModel<Scalar>, precision: PrecisionPolicy) -> OptimizationState {
        let optimizer =
            TrainerOptimizer::new(model.parameters().to_vec(), AdamConfig::new(0.1, 0.0)).unwrap();
        OptimizationState::from_parts(optimizer, CosineWarmRestarts::new(0.1).unwrap(), precision)
    }

    #[test]
    fn unscaled_step_updates_and_advances_schedule() {
        let model = ReplicatedModel::new(Scalar::new(1.0), None).unwrap();
        let ctx = TrainingContext::cpu(WorkerRole::Single);
        let mut state =
            OptimizationState::new(model.parameters().to_vec(), 0.1, 0.0, &ctx).unwrap();
        assert!(matches!(state.precision(), PrecisionPolicy::Unscaled));

        let outcome = state.step(&model.model().loss(1.0), &model).unwrap();
        assert_eq!(outcome, StepOutcome::Applied);
        assert!(model.model().value() < 1.0);
        assert_eq!(state.scheduler().steps(), 1);
        assert!(state.learning_rate() < 0.1);
    }

    #[test]
    fn scaled_step_matches_unscaled_update() {
        let plain = ReplicatedModel::new(Scalar::new(1.0), None).unwrap();
        let scaled = ReplicatedModel::new(Scalar::new(1.0), None).unwrap();
        let mut plain_state = state_for(&plain, PrecisionPolicy::Unscaled);
        let mut scaled_state = state_for(
            &scaled,
            PrecisionPolicy::Scaled(GradientScaler::with_config(LossScaleConfig {
                initial_scale: 1024.0,
                ..LossScaleConfig::default()
            })),
        );

        plain_state.step(&plain.model().loss(0.5), &plain).unwrap();
        let outcome = scaled_state.step(&scaled.model().loss(0.5), &scaled).unwrap();
        assert_eq!(outcome, StepOutcome::Applied);
        assert_eq!(plain.model().value(), scaled.model().value());
    }

    #[test]
    fn overflow_skips_update_and_backs_off() {
        let model = ReplicatedModel::new(Scalar::new(1.0), None).unwrap();
        let mut state = state_for(&model, PrecisionPolicy::Scaled(GradientScaler::new()));

        let outcome = state.step(&model.model().loss(1e38), &model).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Skipped {
                loss_scale: 32768.0
            }
        );
        assert_eq!(model.model().value(), 1.0);
        assert_eq!(state.optimizer().step_count(), 0);
        // the schedule still advances
        assert_eq!(state.scheduler().steps(), 1);
    }

    #[test]
    fn snapshot_restores_every_part() {
        let model = ReplicatedModel::new(Scalar::new(1.0), None).unwrap();
        let mut state = state_for(&model, PrecisionPolicy::Scaled(GradientScaler::new()));
        for _ in 0..WARM_RESTART_PERIOD + 3 {
            state.step(&model.model().loss(0.3), &model).unwrap();
        }
        let snapshot = state.snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();

        let other = ReplicatedModel::new(Scalar::new(1.0), None).unwrap();
        let mut restored = state_for(&other, PrecisionPolicy::Scaled(GradientScaler::new()));
        restored.restore(serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(restored.snapshot().unwrap(), snapshot);
        assert_eq!(restored.learning_rate(), state.learning_rate());
    }
}
