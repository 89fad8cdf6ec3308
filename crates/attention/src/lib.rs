//! Exact attention primitives for the transformer project.
//!
//! The crate computes:
//!
//! * scaled dot-product attention over `[batch, seq_len, hidden_dim]`
//!   ([`reference::scaled_dot_product_attention`]);
//! * multi-head attention with an output projection over
//!   `[batch, heads, seq_len, head_dim]` ([`reference::multi_head_attention`]);
//! * grouped-query attention over `[batch, seq_len, heads, head_dim]` with
//!   optional causal masking, ALiBi bias and padding masks
//!   ([`reference::grouped_query_attention`]).
//!
//! All tensors of a call share one float dtype. Softmax and masking run in
//! `f32` (`f64` inputs stay `f64`); outputs match the input dtype. Masks are additive (`0` / `-inf`)
//! and applied before the softmax. Rows with every key masked follow
//! [`DegenerateRowPolicy`]. Rotary embeddings are applied through
//! [`interop::RopeAdapter`] or [`reference::ExactAttention::with_rope`].

pub mod core;
pub mod interop;
pub mod masks;
pub mod reference;

pub use self::core::{
    Attention, AttentionError, AttentionShape, Config, DegenerateRowPolicy, PrecisionPolicy,
};
pub use reference::{
    grouped_query_attention, multi_head_attention, repeat_kv, scaled_dot_product_attention,
    scaled_dot_product_attention_with_bias, ExactAttention, GqaOutput,
};
