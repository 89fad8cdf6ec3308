//! Portable, exact attention implementations.
//!
//! These paths favour clarity over absolute performance and serve as the
//! baseline for validating optimized kernels.

pub mod dot_product;
pub mod exact;
pub mod grouped;
pub mod multi_head;
pub mod softmax;

pub use dot_product::{scaled_dot_product_attention, scaled_dot_product_attention_with_bias};
pub use exact::ExactAttention;
pub use grouped::{grouped_query_attention, repeat_kv, GqaOutput};
pub use multi_head::multi_head_attention;
pub use softmax::masked_softmax_last_dim;
