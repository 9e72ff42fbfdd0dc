use candle_core::{backprop::GradStore, Tensor, Var};

use super::{GradientScaler, GradientScalerState, TrainerOptimizer};
use crate::{
    context::{PrecisionKind, TrainingContext},
    distributed::ReplicatedModel,
    model::Seq2SeqModel,
    TrainingError,
};

/// How the backward pass and parameter update treat reduced precision.
/// Chosen once from the device.
#[derive(Debug, Clone)]
pub enum PrecisionPolicy {
    Scaled(GradientScaler),
    Unscaled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied,
    /// Non-finite gradients were found; parameters were left untouched and
    /// the scale was lowered to `loss_scale`.
    Skipped { loss_scale: f32 },
}

impl PrecisionPolicy {
    pub fn for_context(ctx: &TrainingContext) -> Self {
        match ctx.precision() {
            PrecisionKind::Scaled => PrecisionPolicy::Scaled(GradientScaler::new()),
            PrecisionKind::Unscaled => PrecisionPolicy::Unscaled,
        }
    }

    pub fn scaler(&self) -> Option<&GradientScaler> {
        match self {
            PrecisionPolicy::Scaled(scaler) => Some(scaler),
            PrecisionPolicy::Unscaled => None,
        }
    }

    /// Backpropagates `loss`, multiplied by the loss scale when scaling.
    pub fn backward<M: Seq2SeqModel>(
        &self,
        loss: &Tensor,
        model: &ReplicatedModel<M>,
    ) -> Result<GradStore, TrainingError> {
        match self {
            PrecisionPolicy::Scaled(scaler) => model.backward(&scaler.scale(loss)?),
            PrecisionPolicy::Unscaled => model.backward(loss),
        }
    }

    /// Applies the optimizer to `grads`. A scaled policy first divides the
    /// gradients by the scale and skips the update if any is non-finite.
    pub fn step(
        &mut self,
        grads: &mut GradStore,
        optimizer: &mut TrainerOptimizer,
    ) -> Result<StepOutcome, TrainingError> {
        let scaler = match self {
            PrecisionPolicy::Unscaled => {
                optimizer.step(grads)?;
                return Ok(StepOutcome::Applied);
            }
            PrecisionPolicy::Scaled(scaler) => scaler,
        };

        let mut unscaled: Vec<(Var, Tensor)> = Vec::new();
        for var in optimizer.parameters() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                unscaled.push((var.clone(), scaler.unscale(grad)?));
            }
        }

        let found_inf = scaler.has_overflow(unscaled.iter().map(|(_, grad)| grad))?;
        for (var, grad) in unscaled {
            grads.insert(var.as_tensor(), grad);
        }

        if found_inf {
            scaler.update(true);
            optimizer.zero_grad(grads);
            return Ok(StepOutcome::Skipped {
                loss_scale: scaler.loss_scale(),
            });
        }

        optimizer.step(grads)?;
        scaler.update(false);
        Ok(StepOutcome::Applied)
    }

    pub fn state(&self) -> Option<GradientScalerState> {
        self.scaler().map(GradientScaler::state)
    }

    /// Restores the scaler. A checkpoint from an unscaled run leaves a fresh
    /// scaler in place, and scaler state is ignored by an unscaled policy.
    pub fn load_state(&mut self, state: Option<&GradientScalerState>) -> Result<(), TrainingError> {
        match (self, state) {
            (PrecisionPolicy::Scaled(scaler), Some(state)) => scaler.load_state(state),
            _ => Ok(()),
        }
    }
}
