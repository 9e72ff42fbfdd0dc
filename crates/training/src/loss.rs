use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Token-level cross entropy that skips targets equal to `ignore_index`.
///
/// Logits are promoted to F32 before the softmax regardless of the dtype the
/// model ran in.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = *dims
            .last()
            .ok_or_else(|| TrainingError::runtime("logits tensor missing vocabulary dimension"))?;
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(format!(
                "target shape {:?} does not match logits {:?}",
                targets.dims(),
                dims
            )));
        }

        let token_count: usize = token_dims.iter().copied().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .to_dtype(DType::F32)
            .and_then(|t| t.reshape((token_count, vocab_size)))
            .map_err(to_runtime_error)?;

        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .and_then(|t| t.reshape((token_count,)))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = if let Some(ignore_index) = self.ignore_index {
            targets_flat
                .ne(ignore_index)
                .and_then(|t| t.to_dtype(DType::F32))
                .map_err(to_runtime_error)?
        } else {
            Tensor::ones((token_count,), DType::F32, device).map_err(to_runtime_error)?
        };

        let valid_tokens = valid_mask
            .sum_all()
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;
        if valid_tokens == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .and_then(|t| t.neg())
            .and_then(|t| t.squeeze(1))
            .map_err(to_runtime_error)?;

        let loss_sum = (&nll * &valid_mask)
            .and_then(|t| t.sum_all())
            .map_err(to_runtime_error)?;
        let average_loss = loss_sum
            .affine(1f64 / valid_tokens as f64, 0.0)
            .map_err(to_runtime_error)?;
        let average_loss_value = average_loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        // accuracy counts every position, padded targets included
        let correct_tokens = logits_flat
            .argmax(D::Minus1)
            .and_then(|p| p.eq(&targets_flat))
            .and_then(|c| c.to_dtype(DType::F32))
            .and_then(|c| c.sum_all())
            .and_then(|c| c.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss: average_loss,
            metrics: LossMetrics {
                average_loss: average_loss_value,
                valid_tokens,
                total_tokens: token_count,
                correct_tokens,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LossMetrics {
    average_loss: f32,
    valid_tokens: usize,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    /// Targets that contributed to the loss.
    pub fn valid_tokens(&self) -> usize {
        self.valid_tokens
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
