//! Key-padding masks for batches whose sequences end before `k_len`.

use candle_core::{Device, Tensor};

use crate::core::AttentionError;

use super::MASK_DTYPE;

/// Additive mask `[batch, 1, q_len, k_len]` hiding keys at index
/// `>= key_lengths[b]`.
///
/// The head axis is left at `1` so grouped attention broadcasts it over all
/// query heads. A zero length masks every key of that batch entry, which the
/// softmax then resolves through [`DegenerateRowPolicy`](crate::DegenerateRowPolicy).
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor, AttentionError> {
    if key_lengths.is_empty() {
        return Err(AttentionError::invalid("padding mask needs at least one sequence"));
    }
    if let Some(&too_long) = key_lengths.iter().find(|&&len| len > k_len) {
        return Err(AttentionError::invalid(format!(
            "key length {too_long} exceeds k_len {k_len}"
        )));
    }

    let batch = key_lengths.len();
    let keys: Vec<f32> = key_lengths
        .iter()
        .flat_map(|&valid| (0..k_len).map(move |k| if k < valid { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(keys, (batch, 1, 1, k_len), device)?
        .to_dtype(MASK_DTYPE)?
        .broadcast_as((batch, 1, q_len, k_len))?
        .contiguous()?;
    Ok(mask)
}
