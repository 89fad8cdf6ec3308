//! Reference attention kernel behind the [`Attention`](crate::core::Attention) trait.
//!
//! The exact path prioritises numerical fidelity: it validates the grouped
//! head-major geometry, optionally rotates queries/keys with RoPE, and defers
//! to the shared grouped kernel for scoring, masking and the value mix.

use std::sync::OnceLock;

use candle_core::Tensor;
use embedding::positional::rope::RopeConfig;

use crate::core::shape::ensure_float_dtype;
use crate::core::{Attention, AttentionError, AttentionShape, Config};
use crate::interop::RopeAdapter;

use super::grouped::{attend_head_major, GqaOutput};

/// Numerically stable, portable attention kernel with optional RoPE support.
///
/// The kernel holds no tensor state between calls: rotary tables are built
/// for each call on the device of its inputs.
#[derive(Debug)]
pub struct ExactAttention {
    rope_config: Option<RopeConfig>,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    /// Construct a reference attention kernel without RoPE support.
    pub fn new() -> Self {
        Self {
            rope_config: None,
            first_call: OnceLock::new(),
        }
    }

    /// Construct a reference attention kernel configured with rotary embeddings.
    ///
    /// Queries and keys are rotated from position zero before scoring.
    pub fn with_rope(rope_config: RopeConfig) -> Result<Self, AttentionError> {
        rope_config.validate()?;
        Ok(Self {
            rope_config: Some(rope_config),
            first_call: OnceLock::new(),
        })
    }

    /// Full attention call over head-major tensors.
    ///
    /// `bias` is an additive score term such as ALiBi, `mask` an additive
    /// padding mask; see [`grouped_query_attention`](super::grouped_query_attention)
    /// for the accepted shapes. The output stays head-major,
    /// `[batch, num_heads, q_len, head_dim]`. `config` is used as given; call
    /// [`Config::apply_env_overrides`] beforehand to honour `ATTN_*` variables.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<GqaOutput, AttentionError> {
        if self.first_call.set(()).is_ok() {
            let rope_summary = self
                .rope_config
                .as_ref()
                .map(RopeConfig::fingerprint)
                .unwrap_or_else(|| "none".to_string());
            log::info!(
                "attention::reference init causal={} need_weights={} precision={:?} degenerate_rows={:?} rope={}",
                config.is_causal,
                config.need_weights,
                config.precision,
                config.degenerate_rows,
                rope_summary
            );
        }

        let shape = AttentionShape::head_major(q, k, v)?;
        ensure_float_dtype(&[q, k, v])?;
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::invalid(
                "q, k, v must reside on the same device",
            ));
        }

        let (q, k) = self.rotate(q, k, &shape)?;
        attend_head_major(&q, &k, v, &shape, config, bias, mask)
    }

    fn rotate(
        &self,
        q: &Tensor,
        k: &Tensor,
        shape: &AttentionShape,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let Some(rope_config) = &self.rope_config else {
            return Ok((q.clone(), k.clone()));
        };
        if shape.q_len != shape.kv_len {
            return Err(AttentionError::shape(format!(
                "rotary embeddings need matching query/key lengths, got {} and {}",
                shape.q_len, shape.kv_len
            )));
        }

        let mut adapter = RopeAdapter::new(rope_config.clone(), q.device().clone());
        Ok(adapter.apply(q, k, 0)?)
    }
}

impl Default for ExactAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        Ok(self.forward(q, k, v, None, mask, config)?.output)
    }
}
