//! Embedding crate
//!
//! The positional module exposes rotary positional embeddings and ALiBi
//! attention biases consumed by the attention kernels.

pub mod errors;
pub mod positional;

pub use errors::{EmbeddingError, Result};
pub use positional::*;
