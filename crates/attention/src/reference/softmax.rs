//! Softmax over additive-masked scores.

use candle_core::{DType, Tensor, D};

use crate::core::shape::accumulation_dtype;
use crate::core::{AttentionError, DegenerateRowPolicy};

/// Softmax along the last axis that tolerates `-inf` entries.
///
/// Masked (`-inf`) scores receive exactly zero weight and take no part in
/// the normalisation. A row with every entry masked is handled by `policy`:
/// [`DegenerateRowPolicy::ZeroWeights`] yields an all-zero row,
/// [`DegenerateRowPolicy::Error`] fails with
/// [`AttentionError::NumericDegenerate`]. Half-precision scores are widened
/// to `f32` (`f64` stays `f64`); the result is cast back to the input dtype.
pub fn masked_softmax_last_dim(
    scores: &Tensor,
    policy: DegenerateRowPolicy,
) -> Result<Tensor, AttentionError> {
    let dtype = scores.dtype();
    let scores = scores.to_dtype(accumulation_dtype(dtype))?;

    // A fully masked row has a -inf maximum; clamp it so exp() gives zeros, not NaN.
    let row_max = scores.max_keepdim(D::Minus1)?.maximum(f32::MIN)?;
    let exp = scores.broadcast_sub(&row_max)?.exp()?;
    let denom = exp.sum_keepdim(D::Minus1)?;

    let degenerate = denom
        .eq(0f32)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()? as usize;
    if degenerate > 0 {
        match policy {
            DegenerateRowPolicy::Error => {
                return Err(AttentionError::NumericDegenerate { rows: degenerate })
            }
            DegenerateRowPolicy::ZeroWeights => {
                log::warn!("attention: {degenerate} fully masked rows produce zero weights")
            }
        }
    }

    let probs = exp.broadcast_div(&denom.maximum(f32::MIN_POSITIVE)?)?;
    Ok(probs.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn plain_rows_match_reference_softmax() {
        let device = Device::Cpu;
        let scores = Tensor::new(&[[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]], &device).unwrap();
        let probs = masked_softmax_last_dim(&scores, DegenerateRowPolicy::ZeroWeights)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let z = 1f32.exp() + 2f32.exp() + 3f32.exp();
        assert!((probs[0][2] - 3f32.exp() / z).abs() < 1e-6);
        for p in &probs[1] {
            assert!((p - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn masked_entries_get_zero_weight() {
        let device = Device::Cpu;
        let scores = Tensor::new(&[[0.5f32, f32::NEG_INFINITY, 0.5]], &device).unwrap();
        let probs = masked_softmax_last_dim(&scores, DegenerateRowPolicy::Error)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(probs[0][1], 0.0);
        assert!((probs[0][0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn double_precision_is_kept() {
        let device = Device::Cpu;
        let scores = Tensor::new(&[[1e-9f64, 0.0]], &device).unwrap();
        let probs = masked_softmax_last_dim(&scores, DegenerateRowPolicy::Error).unwrap();
        assert_eq!(probs.dtype(), DType::F64);
        let probs = probs.to_vec2::<f64>().unwrap();
        let expected = 1.0 / (1.0 + (-1e-9f64).exp());
        assert!((probs[0][0] - expected).abs() < 1e-15);
        assert!(probs[0][0] > probs[0][1]);
    }

    #[test]
    fn fully_masked_rows_follow_policy() {
        let device = Device::Cpu;
        let ninf = f32::NEG_INFINITY;
        let scores = Tensor::new(&[[ninf, ninf], [1.0, ninf]], &device).unwrap();

        let probs = masked_softmax_last_dim(&scores, DegenerateRowPolicy::ZeroWeights)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(probs[0], vec![0.0, 0.0]);
        assert_eq!(probs[1], vec![1.0, 0.0]);

        let err = masked_softmax_last_dim(&scores, DegenerateRowPolicy::Error).unwrap_err();
        assert!(matches!(err, AttentionError::NumericDegenerate { rows: 1 }));
    }
}
