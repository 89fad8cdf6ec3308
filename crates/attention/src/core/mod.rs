//! Core traits and types shared across attention implementations.
//!
//! Kernels behind the [`Attention`] trait take head-major tensors
//! `[batch, n_heads, seq_len, head_dim]`. Keys and values may carry fewer heads
//! than queries as long as the query head count is a multiple of theirs.
//! Softmax and masking accumulate in `f32`, or `f64` for `f64` inputs.

pub mod config;
pub mod errors;
pub mod shape;

use candle_core::Tensor;

pub use config::{Config, DegenerateRowPolicy, PrecisionPolicy};
pub use errors::AttentionError;
pub use shape::AttentionShape;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_kv_heads, k_len, head_dim]` with `n_heads % n_kv_heads == 0`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, are additive and shaped `[batch, 1 or n_heads, q_len, k_len]`.
/// * The causal mask is governed by [`Config::is_causal`].
pub trait Attention {
    /// Compute attention with an optional additive mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
