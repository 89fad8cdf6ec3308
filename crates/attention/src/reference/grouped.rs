//! Grouped-query attention (GQA).
//!
//! Several query heads share one key/value head. Key/value head `g` serves
//! query heads `[g * r, (g + 1) * r)` with `r = num_heads / num_kv_heads`;
//! multi-head attention is the `r = 1` case and multi-query attention the
//! `num_kv_heads = 1` case.

use candle_core::Tensor;

use crate::core::shape::{accumulation_dtype, ensure_float_dtype};
use crate::core::{AttentionError, AttentionShape, Config, PrecisionPolicy};
use crate::masks::{build_causal_mask, MASK_DTYPE};

use super::softmax::masked_softmax_last_dim;

/// Result of a grouped attention call.
#[derive(Debug, Clone)]
pub struct GqaOutput {
    /// Attention output in the caller's layout and dtype.
    pub output: Tensor,
    /// Softmax weights `[batch, num_heads, q_len, kv_len]`, present when
    /// [`Config::need_weights`] is set.
    pub weights: Option<Tensor>,
}

/// Repeat every key/value head `n_rep` times along the head axis of a
/// `[batch, kv_seq_len, num_kv_heads, head_dim]` tensor, keeping copies of the
/// same head contiguous.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> candle_core::Result<Tensor> {
    repeat_heads(x, n_rep, 2)
}

pub(crate) fn repeat_heads(x: &Tensor, n_rep: usize, head_axis: usize) -> candle_core::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let mut dims = x.dims().to_vec();
    let mut expanded = dims.clone();
    expanded.insert(head_axis + 1, n_rep);
    dims[head_axis] *= n_rep;
    x.unsqueeze(head_axis + 1)?
        .broadcast_as(expanded)?
        .reshape(dims)
}

/// Grouped-query attention over sequence-major tensors.
///
/// * `q`: `[batch, seq_len, num_heads, head_dim]`
/// * `k`, `v`: `[batch, kv_seq_len, num_kv_heads, head_dim]`
/// * `bias`: optional additive score term (e.g. ALiBi) broadcastable to
///   `[batch, num_heads, seq_len, kv_seq_len]`, typically `[num_heads, seq_len, kv_seq_len]`.
/// * `mask`: optional additive padding mask `[batch, 1 | num_heads, seq_len, kv_seq_len]`.
///
/// Scores receive the bias first, then the causal mask (when
/// [`Config::is_causal`]), then the padding mask. The output is
/// `[batch, seq_len, num_heads, head_dim]`.
pub fn grouped_query_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &Config,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
) -> Result<GqaOutput, AttentionError> {
    let shape = AttentionShape::sequence_major(q, k, v)?;
    ensure_float_dtype(&[q, k, v])?;

    let q = q.transpose(1, 2)?.contiguous()?;
    let k = k.transpose(1, 2)?.contiguous()?;
    let v = v.transpose(1, 2)?.contiguous()?;
    let GqaOutput { output, weights } = attend_head_major(&q, &k, &v, &shape, config, bias, mask)?;

    Ok(GqaOutput {
        output: output.transpose(1, 2)?.contiguous()?,
        weights,
    })
}

/// Shared kernel over head-major tensors whose geometry has been validated.
pub(crate) fn attend_head_major(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    shape: &AttentionShape,
    config: &Config,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
) -> Result<GqaOutput, AttentionError> {
    let dtype = q.dtype();
    let accumulate = accumulation_dtype(dtype);
    let compute = match config.precision {
        PrecisionPolicy::ForceF32 => accumulate,
        PrecisionPolicy::Inherit => dtype,
    };

    let group = shape.group_size();
    let q = q.to_dtype(compute)?.contiguous()?;
    let k = repeat_heads(&k.to_dtype(compute)?, group, 1)?;
    let v = repeat_heads(&v.to_dtype(compute)?, group, 1)?.contiguous()?;

    let scale = 1.0 / (shape.head_dim as f64).sqrt();
    let scores = q
        .matmul(&k.t()?.contiguous()?)?
        .affine(scale, 0.0)?
        .to_dtype(accumulate)?;
    let scores = add_score_terms(scores, shape, config.is_causal, bias, mask)?;
    let weights = masked_softmax_last_dim(&scores, config.degenerate_rows)?;

    let output = weights.to_dtype(compute)?.matmul(&v)?.to_dtype(dtype)?;
    let weights = if config.need_weights {
        Some(weights.to_dtype(dtype)?)
    } else {
        None
    };
    Ok(GqaOutput { output, weights })
}

fn add_score_terms(
    mut scores: Tensor,
    shape: &AttentionShape,
    is_causal: bool,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
) -> Result<Tensor, AttentionError> {
    let full = (shape.batch, shape.num_heads, shape.q_len, shape.kv_len);

    if let Some(bias) = bias {
        let expanded = bias.broadcast_as(full).map_err(|_| {
            AttentionError::shape(format!(
                "bias {:?} does not broadcast to {:?}",
                bias.dims(),
                full
            ))
        })?;
        scores = scores.add(&expanded.to_dtype(scores.dtype())?)?;
    }

    if is_causal {
        let causal = build_causal_mask(scores.device(), 1, 1, shape.q_len, shape.kv_len)?
            .to_dtype(scores.dtype())?;
        scores = scores.broadcast_add(&causal)?;
    }

    if let Some(mask) = mask {
        if mask.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
            });
        }
        let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
            AttentionError::shape("mask must have shape [batch, heads|1, q_len, k_len]")
        })?;
        let (batch, heads, q_len, k_len) = full;
        if mb != batch || mq != q_len || mk != k_len || (mh != 1 && mh != heads) {
            return Err(AttentionError::shape(format!(
                "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
            )));
        }
        scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
    }

    Ok(scores)
}
