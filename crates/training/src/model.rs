use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::{Init, VarBuilder, VarMap};

use crate::{masks::MaskSet, TrainingError};

/// Sequence-to-sequence model driven by the training loop.
pub trait Seq2SeqModel: Send {
    /// Returns logits `[B, L, V]` for `decoder_input [B, L]` conditioned on
    /// `prompt [B, P]`, computed in `compute_dtype`.
    fn forward(
        &self,
        prompt: &Tensor,
        decoder_input: &Tensor,
        masks: &MaskSet,
        compute_dtype: DType,
    ) -> Result<Tensor>;

    /// Trainable parameters, in a stable order shared by every replica.
    fn parameters(&self) -> Vec<(String, Var)>;
}

#[derive(Debug, Clone, Copy)]
pub struct PooledContextConfig {
    pub vocab_size: usize,
    pub max_positions: usize,
    pub embed_dim: usize,
    pub init_std: f64,
}

/// Small baseline: the prompt is mean-pooled into a context vector, each
/// decoder position averages the embeddings it may attend to, and a tanh layer
/// over the sum feeds a vocabulary projection.
pub struct PooledContextModel {
    config: PooledContextConfig,
    token_embedding: Tensor,
    position_embedding: Tensor,
    hidden_weight: Tensor,
    hidden_bias: Tensor,
    output_weight: Tensor,
    output_bias: Tensor,
    parameters: Vec<(String, Var)>,
}

impl PooledContextModel {
    pub fn new(config: PooledContextConfig, device: &Device) -> std::result::Result<Self, TrainingError> {
        if config.vocab_size == 0 || config.max_positions == 0 || config.embed_dim == 0 {
            return Err(TrainingError::initialization(format!(
                "model dimensions must be positive: {config:?}"
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let normal = Init::Randn {
            mean: 0.0,
            stdev: config.init_std,
        };
        let zeros = Init::Const(0.0);
        let (v, d) = (config.vocab_size, config.embed_dim);

        let embedding = vb.pp("embedding");
        let token_embedding = embedding.get_with_hints((v, d), "token", normal)?;
        let position_embedding =
            embedding.get_with_hints((config.max_positions, d), "position", normal)?;
        let hidden = vb.pp("hidden");
        let hidden_weight = hidden.get_with_hints((d, d), "weight", normal)?;
        let hidden_bias = hidden.get_with_hints(d, "bias", zeros)?;
        let output = vb.pp("output");
        let output_weight = output.get_with_hints((d, v), "weight", normal)?;
        let output_bias = output.get_with_hints(v, "bias", zeros)?;

        let mut parameters: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| TrainingError::initialization("model variable map lock poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        parameters.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            config,
            token_embedding,
            position_embedding,
            hidden_weight,
            hidden_bias,
            output_weight,
            output_bias,
            parameters,
        })
    }

    pub fn config(&self) -> PooledContextConfig {
        self.config
    }

    fn embed(&self, ids: &Tensor, table: &Tensor) -> Result<Tensor> {
        let (batch, len) = ids.dims2()?;
        let d = self.config.embed_dim;
        table.index_select(&ids.flatten_all()?, 0)?.reshape((batch, len, d))
    }

    /// Masked mean of the prompt embeddings, `[B, D]`.
    fn pooled_context(&self, prompt: &Tensor, masks: &MaskSet, table: &Tensor) -> Result<Tensor> {
        let dtype = table.dtype();
        let embedded = self.embed(prompt, table)?;
        let keep = masks
            .prompt_padding
            .to_dtype(dtype)?
            .affine(-1.0, 1.0)?
            .unsqueeze(D::Minus1)?;
        let summed = embedded.broadcast_mul(&keep)?.sum(1)?;
        let counts = keep.sum(1)?.maximum(1.0)?;
        summed.broadcast_div(&counts)
    }

    /// Each position averages the non-padded decoder embeddings at or before
    /// it, `[B, L, D]`.
    fn causal_prefix(
        &self,
        decoder_input: &Tensor,
        masks: &MaskSet,
        table: &Tensor,
        positions: &Tensor,
    ) -> Result<Tensor> {
        let dtype = table.dtype();
        let (_, len) = decoder_input.dims2()?;
        if len > self.config.max_positions {
            candle_core::bail!(
                "decoder length {len} exceeds {} positions",
                self.config.max_positions
            );
        }
        let embedded = self
            .embed(decoder_input, table)?
            .broadcast_add(&positions.narrow(0, 0, len)?)?;

        let visible = masks.causal.to_dtype(dtype)?.affine(-1.0, 1.0)?.unsqueeze(0)?;
        let present = masks
            .decoder_padding
            .to_dtype(dtype)?
            .affine(-1.0, 1.0)?
            .unsqueeze(1)?;
        let allowed = visible.broadcast_mul(&present)?;
        let counts = allowed.sum_keepdim(D::Minus1)?.maximum(1.0)?;
        allowed.broadcast_div(&counts)?.matmul(&embedded)
    }
}

impl Seq2SeqModel for PooledContextModel {
    fn forward(
        &self,
        prompt: &Tensor,
        decoder_input: &Tensor,
        masks: &MaskSet,
        compute_dtype: DType,
    ) -> Result<Tensor> {
        let table = self.token_embedding.to_dtype(compute_dtype)?;
        let positions = self.position_embedding.to_dtype(compute_dtype)?;

        let context = self.pooled_context(prompt, masks, &table)?;
        let prefix = self.causal_prefix(decoder_input, masks, &table, &positions)?;

        let hidden = prefix
            .broadcast_add(&context.unsqueeze(1)?)?
            .broadcast_matmul(&self.hidden_weight.to_dtype(compute_dtype)?)?
            .broadcast_add(&self.hidden_bias.to_dtype(compute_dtype)?)?
            .tanh()?;
        hidden
            .broadcast_matmul(&self.output_weight.to_dtype(compute_dtype)?)?
            .broadcast_add(&self.output_bias.to_dtype(compute_dtype)?)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.parameters.clone()
    }
}
