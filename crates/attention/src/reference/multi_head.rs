//! Multi-head attention with an output projection.

use candle_core::{Tensor, D};

use crate::core::shape::dims4;
use crate::core::AttentionError;

use super::dot_product::scaled_dot_product_attention;

const HEAD_MAJOR: &str = "[batch, heads, seq_len, head_dim]";

/// Run scaled dot-product attention per head and merge the heads through
/// `projection`.
///
/// `q`, `k`, `v` are `[batch, heads, seq_len, head_dim]`; `projection` is the
/// square `[heads * head_dim, heads * head_dim]` output matrix applied as
/// `concat · projectionᵀ`. Heads only interact through the projection. The
/// result is `[batch, q_len, heads * head_dim]`.
pub fn multi_head_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    projection: &Tensor,
) -> Result<Tensor, AttentionError> {
    let (batch, heads, _q_len, head_dim) = dims4(q, "query", HEAD_MAJOR)?;
    let (kb, kh, _k_len, kd) = dims4(k, "key", HEAD_MAJOR)?;
    let (vb, vh, _v_len, vd) = dims4(v, "value", HEAD_MAJOR)?;
    if (kb, kh, kd) != (batch, heads, head_dim) || (vb, vh, vd) != (batch, heads, head_dim) {
        return Err(AttentionError::shape(format!(
            "head layout mismatch: query {:?}, key {:?}, value {:?}",
            q.dims(),
            k.dims(),
            v.dims()
        )));
    }

    let (rows, cols) = projection.dims2().map_err(|_| {
        AttentionError::shape(format!(
            "projection must be a matrix, got {:?}",
            projection.dims()
        ))
    })?;
    let hidden = heads * head_dim;
    if rows != cols || rows != hidden {
        return Err(AttentionError::shape(format!(
            "projection [{rows}, {cols}] does not match heads * head_dim = {hidden}"
        )));
    }

    let head_slice = |t: &Tensor, head: usize| t.narrow(1, head, 1)?.squeeze(1)?.contiguous();
    let per_head = (0..heads)
        .map(|head| {
            scaled_dot_product_attention(
                &head_slice(q, head)?,
                &head_slice(k, head)?,
                &head_slice(v, head)?,
            )
        })
        .collect::<Result<Vec<_>, AttentionError>>()?;

    let merged = Tensor::cat(&per_head, D::Minus1)?;
    Ok(merged.broadcast_matmul(&projection.t()?.contiguous()?)?)
}
