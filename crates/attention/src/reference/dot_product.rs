//! Single head-group scaled dot-product attention.

use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;

use crate::core::shape::{dims3, ensure_float_dtype};
use crate::core::AttentionError;

/// `softmax(q · kᵀ / sqrt(hidden_dim)) · v` for `[batch, seq_len, hidden_dim]` inputs.
///
/// No masking is applied. The output is `[batch, q_len, hidden_dim]`.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
) -> Result<Tensor, AttentionError> {
    scaled_dot_product_attention_with_bias(q, k, v, None)
}

/// Same as [`scaled_dot_product_attention`] with an optional additive score
/// term (e.g. ALiBi) broadcastable to `[batch, q_len, k_len]`, added before
/// the softmax. The bias must be finite; masking belongs to
/// [`grouped_query_attention`](super::grouped_query_attention).
pub fn scaled_dot_product_attention_with_bias(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Tensor, AttentionError> {
    let (batch, q_len, hidden) = dims3(q, "query")?;
    let (kb, k_len, kh) = dims3(k, "key")?;
    let (vb, v_len, vh) = dims3(v, "value")?;

    if kh != hidden || vh != hidden {
        return Err(AttentionError::shape(format!(
            "hidden_dim mismatch: query {hidden}, key {kh}, value {vh}"
        )));
    }
    if v_len != k_len {
        return Err(AttentionError::shape(format!(
            "key and value sequence lengths differ: {k_len} vs {v_len}"
        )));
    }
    if kb != batch || vb != batch {
        return Err(AttentionError::shape(format!(
            "batch mismatch: query {batch}, key {kb}, value {vb}"
        )));
    }
    if q_len == 0 || k_len == 0 || hidden == 0 {
        return Err(AttentionError::shape(format!(
            "sequence lengths and hidden_dim must be non-zero (q_len={q_len}, k_len={k_len}, hidden_dim={hidden})"
        )));
    }
    ensure_float_dtype(&[q, k, v])?;

    let scale = 1.0 / (hidden as f64).sqrt();
    let k_t = k.t()?.contiguous()?;
    let mut scores = q.contiguous()?.matmul(&k_t)?.affine(scale, 0.0)?;

    if let Some(bias) = bias {
        let target = (batch, q_len, k_len);
        let expanded = bias.broadcast_as(target).map_err(|_| {
            AttentionError::shape(format!(
                "bias {:?} does not broadcast to {:?}",
                bias.dims(),
                target
            ))
        })?;
        scores = scores.add(&expanded.to_dtype(scores.dtype())?)?;
    }

    let weights = softmax_last_dim(&scores)?;
    Ok(weights.matmul(&v.contiguous()?)?)
}
