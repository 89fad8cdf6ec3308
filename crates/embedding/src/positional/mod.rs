//! Positional encodings applied around the attention score computation.
//!
//! * [`rope`] rotates query/key feature pairs before scoring.
//! * [`alibi`] produces additive per-head distance penalties for the scores.

pub mod alibi;
pub mod rope;

pub use alibi::{alibi_factors, compute_alibi, compute_alibi_with_lengths};
pub use rope::{
    apply_rope_to_qk, apply_rotary, apply_rotary_dense, get_sin_cos, get_sin_cos_with_dtype,
    inverse_frequencies, rotation_matrix, Rope, RopeConfig,
};
