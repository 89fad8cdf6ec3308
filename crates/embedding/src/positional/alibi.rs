//! ALiBi (attention with linear biases).
//!
//! Head `h` (1-based) penalises the score between query `i` and key `j` by
//! `-(i - j) / 2^(h * 8 / num_heads)`. The bias is added to raw attention
//! scores before masking and softmax. Without a causal mask the lower and
//! upper triangles are mirror images up to sign.

use candle_core::{Device, Tensor};

use crate::errors::{EmbeddingError, Result};

/// Geometric decay factors `2^(h * 8 / num_heads)` for `h = 1..=num_heads`.
pub fn alibi_factors(num_heads: usize) -> Result<Vec<f64>> {
    if num_heads == 0 {
        return Err(EmbeddingError::InvalidArgument(
            "num_heads must be non-zero".to_string(),
        ));
    }
    let step = 8.0 / num_heads as f64;
    Ok((1..=num_heads)
        .map(|head| 2f64.powf(head as f64 * step))
        .collect())
}

/// Square ALiBi bias shaped `[num_heads, seq_len, seq_len]` (f32).
pub fn compute_alibi(num_heads: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
    compute_alibi_with_lengths(num_heads, seq_len, seq_len, device)
}

/// ALiBi bias shaped `[num_heads, q_len, k_len]` (f32) for attention where
/// the key span differs from the query span. Query `i` and key `j` share the
/// same origin, matching the top-left aligned causal mask.
pub fn compute_alibi_with_lengths(
    num_heads: usize,
    q_len: usize,
    k_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let factors = alibi_factors(num_heads)?;
    let mut data = Vec::with_capacity(num_heads * q_len * k_len);
    for factor in &factors {
        for i in 0..q_len {
            for j in 0..k_len {
                let distance = i as f64 - j as f64;
                data.push((-distance / factor) as f32);
            }
        }
    }
    Ok(Tensor::from_vec(data, (num_heads, q_len, k_len), device)?)
}
