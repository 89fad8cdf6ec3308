//! Causal masks.
//!
//! Query `i` and key `j` share the same origin: key `j` is hidden from query
//! `i` exactly when `j > i`, whatever the relative lengths.

use candle_core::{Device, Result, Tensor};

use super::MASK_DTYPE;

/// Strict upper-triangular mask `[batch, num_heads, q_len, k_len]`.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let plane: Vec<f32> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(plane, (1, 1, q_len, k_len), device)?
        .to_dtype(MASK_DTYPE)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}
