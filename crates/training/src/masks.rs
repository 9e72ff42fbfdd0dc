//! Attention masks for one decoder step.
//!
//! All masks are `u8` tensors where `1` marks a position that must not be
//! attended to.

use candle_core::{Device, Result, Tensor};

#[derive(Debug, Clone)]
pub struct MaskSet {
    /// `[L, L]`, set where the key lies after the query.
    pub causal: Tensor,
    /// `[B, P]`, set on padded prompt tokens.
    pub prompt_padding: Tensor,
    /// `[B, L]`, set on padded decoder inputs.
    pub decoder_padding: Tensor,
}

impl MaskSet {
    pub fn build(prompt: &Tensor, decoder_input: &Tensor, pad_index: u32) -> Result<Self> {
        let (_, len) = decoder_input.dims2()?;
        Ok(Self {
            causal: causal_mask(len, decoder_input.device())?,
            prompt_padding: padding_mask(prompt, pad_index)?,
            decoder_padding: padding_mask(decoder_input, pad_index)?,
        })
    }
}

/// `[len, len]` mask with ones strictly above the diagonal.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0u8; len * len];
    for q in 0..len {
        for k in q + 1..len {
            data[q * len + k] = 1;
        }
    }
    Tensor::from_vec(data, (len, len), device)
}

pub fn padding_mask(tokens: &Tensor, pad_index: u32) -> Result<Tensor> {
    tokens.eq(pad_index)
}
