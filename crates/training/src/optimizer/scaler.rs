use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// Dynamic loss scaler for half-precision training.
///
/// The loss is multiplied by the current scale before backprop and the
/// gradients are divided by it afterwards. A non-finite gradient skips the
/// step and halves the scale; `growth_interval` clean steps in a row double it.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    loss_scale: f32,
    growth_tracker: usize,
    config: LossScaleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub growth_tracker: usize,
}

impl Default for GradientScaler {
    fn default() -> Self {
        Self::with_config(LossScaleConfig::default())
    }
}

impl GradientScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);
        Self {
            loss_scale: config.initial_scale,
            growth_tracker: 0,
            config,
        }
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        Ok(tensor.affine(self.loss_scale as f64, 0.0)?)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        let inverse = 1.0 / self.loss_scale as f64;
        Ok(tensor.affine(inverse, 0.0)?)
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.loss_scale *= self.config.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.config.growth_interval {
                self.loss_scale *= self.config.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            scale: self.loss_scale,
            growth_factor: self.config.growth_factor,
            backoff_factor: self.config.backoff_factor,
            growth_interval: self.config.growth_interval,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: &GradientScalerState) -> Result<(), TrainingError> {
        if !(state.scale.is_finite() && state.scale > 0.0) {
            return Err(TrainingError::runtime(format!(
                "scaler state has invalid scale {}",
                state.scale
            )));
        }
        self.config = sanitize_config(LossScaleConfig {
            initial_scale: state.scale,
            growth_factor: state.growth_factor,
            backoff_factor: state.backoff_factor,
            growth_interval: state.growth_interval,
        });
        self.loss_scale = state.scale;
        self.growth_tracker = state.growth_tracker.min(self.config.growth_interval);
        Ok(())
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)?
        .abs()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(config.backoff_factor > 0.0 && config.backoff_factor < 1.0) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if !(config.initial_scale.is_finite() && config.initial_scale > 0.0) {
        config.initial_scale = LossScaleConfig::default().initial_scale;
    }
    config
}
