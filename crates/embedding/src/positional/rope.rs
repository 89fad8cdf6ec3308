//! Rotary positional embeddings.
//!
//! Feature pair `(2k, 2k + 1)` at sequence position `p` is rotated by the
//! angle `p * freq[k]`, with `freq[k] = rope_theta^(-2k / head_dim)`. The
//! default `rope_theta` of 10 000 gives the schedule `10^(-8k / head_dim)`:
//! low pairs spin fast, high pairs spin slowly.
//!
//! Two layouts are supported:
//! * sequence-major `[batch, seq_len, num_heads, head_dim]` via
//!   [`apply_rotary`] (and its dense reference [`apply_rotary_dense`]);
//! * head-major `[batch, num_heads, seq_len, head_dim]` via
//!   [`apply_rope_to_qk`], which is what attention kernels consume.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::errors::{EmbeddingError, Result};

/// Configuration for building rotary positional embeddings.
///
/// `ROPE_THETA` may be layered on top through
/// [`RopeConfig::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated. Must be even.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum (defaults to 10k).
    pub rope_theta: f32,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
        }
    }
}

impl RopeConfig {
    /// Default configuration for the given per-head width.
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            ..Self::default()
        }
    }

    /// Check that the geometry supports pairwise rotation.
    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            return Err(EmbeddingError::InvalidArgument(
                "head_dim must be non-zero".to_string(),
            ));
        }
        if self.head_dim % 2 != 0 {
            return Err(EmbeddingError::InvalidArgument(format!(
                "head_dim must be even to pair dimensions, got {}",
                self.head_dim
            )));
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(EmbeddingError::InvalidArgument(format!(
                "rope_theta must be a positive finite value, got {}",
                self.rope_theta
            )));
        }
        Ok(())
    }

    /// Layer `ROPE_THETA` from the process environment on top of this config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Layer overrides resolved through `lookup` (keyed like the environment).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ROPE_THETA") {
            match raw.trim().parse::<f32>() {
                Ok(theta) if theta.is_finite() && theta > 0.0 => self.rope_theta = theta,
                _ => log::warn!("ignoring ROPE_THETA={raw:?}: expected a positive float"),
            }
        }
    }

    /// Stable description of the rotary geometry, used in logs.
    pub fn fingerprint(&self) -> String {
        format!("theta={:.6};head_dim={}", self.rope_theta, self.head_dim)
    }
}

/// Per-pair rotation frequencies, `head_dim / 2` of them, monotonically decreasing.
pub fn inverse_frequencies(cfg: &RopeConfig) -> Result<Vec<f64>> {
    cfg.validate()?;
    let base = cfg.rope_theta as f64;
    let dim = cfg.head_dim as f64;
    Ok((0..cfg.head_dim / 2)
        .map(|idx| base.powf(-((2 * idx) as f64) / dim))
        .collect())
}

/// Build the sine/cosine tables for positions `0..max_seq_len`.
///
/// Both tables are **f32** tensors shaped `[max_seq_len, head_dim / 2]`;
/// callers cast at the usage site if they need another dtype.
pub fn get_sin_cos(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<(Tensor, Tensor)> {
    get_sin_cos_with_dtype(max_seq_len, cfg, device, DType::F32)
}

/// [`get_sin_cos`] with tables in `dtype`. Angles are evaluated in `f64`, so
/// `DType::F64` tables carry full double precision.
pub fn get_sin_cos_with_dtype(
    max_seq_len: usize,
    cfg: &RopeConfig,
    device: &Device,
    dtype: DType,
) -> Result<(Tensor, Tensor)> {
    if max_seq_len == 0 {
        return Err(EmbeddingError::InvalidArgument(
            "max_seq_len must be non-zero".to_string(),
        ));
    }
    let inv_freqs = inverse_frequencies(cfg)?;
    let half_dim = inv_freqs.len();
    log::debug!(
        "building rope sin/cos tables: positions={} dtype={:?} {}",
        max_seq_len,
        dtype,
        cfg.fingerprint()
    );

    let mut sin_data = Vec::with_capacity(max_seq_len * half_dim);
    let mut cos_data = Vec::with_capacity(max_seq_len * half_dim);
    for pos in 0..max_seq_len {
        let pos_f = pos as f64;
        for &inv_freq in &inv_freqs {
            let (sin, cos) = (pos_f * inv_freq).sin_cos();
            sin_data.push(sin);
            cos_data.push(cos);
        }
    }

    let sin = Tensor::from_vec(sin_data, (max_seq_len, half_dim), device)?.to_dtype(dtype)?;
    let cos = Tensor::from_vec(cos_data, (max_seq_len, half_dim), device)?.to_dtype(dtype)?;
    Ok((sin, cos))
}

/// Dense block-diagonal rotation operator for a single position.
///
/// Block `k` is `[[cos, -sin], [sin, cos]]` of angle `position * freq[k]`,
/// giving an f32 `[head_dim, head_dim]` matrix. Reference use only: the
/// table-driven paths never materialise it.
pub fn rotation_matrix(position: usize, cfg: &RopeConfig, device: &Device) -> Result<Tensor> {
    rotation_matrix_in(position, cfg, device, DType::F32)
}

fn rotation_matrix_in(position: usize, cfg: &RopeConfig, device: &Device, dtype: DType) -> Result<Tensor> {
    let inv_freqs = inverse_frequencies(cfg)?;
    let dim = cfg.head_dim;
    let mut data = vec![0f64; dim * dim];
    for (pair, &inv_freq) in inv_freqs.iter().enumerate() {
        let (sin, cos) = (position as f64 * inv_freq).sin_cos();
        let r = 2 * pair;
        data[r * dim + r] = cos;
        data[r * dim + r + 1] = -sin;
        data[(r + 1) * dim + r] = sin;
        data[(r + 1) * dim + r + 1] = cos;
    }
    Ok(Tensor::from_vec(data, (dim, dim), device)?.to_dtype(dtype)?)
}

/// Half-precision inputs rotate in `f32`; `f32` and `f64` keep their dtype.
fn accumulation_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

fn sequence_major_dims(x: &Tensor, cfg: &RopeConfig) -> Result<(usize, usize, usize, usize)> {
    cfg.validate()?;
    let (batch, seq_len, heads, head_dim) = x.dims4().map_err(|_| {
        EmbeddingError::ShapeMismatch(format!(
            "expected [batch, seq_len, num_heads, head_dim], got {:?}",
            x.dims()
        ))
    })?;
    if head_dim != cfg.head_dim {
        return Err(EmbeddingError::ShapeMismatch(format!(
            "input head_dim {head_dim} does not match configured head_dim {}",
            cfg.head_dim
        )));
    }
    Ok((batch, seq_len, heads, head_dim))
}

/// Rotate `[batch, seq_len, num_heads, head_dim]` by building one dense
/// rotation per position and right-multiplying by its transpose.
///
/// This is the direct construction; [`apply_rotary`] produces the same
/// values without the per-position matrices.
pub fn apply_rotary_dense(x: &Tensor, cfg: &RopeConfig) -> Result<Tensor> {
    let (batch, seq_len, heads, head_dim) = sequence_major_dims(x, cfg)?;
    if seq_len == 0 {
        return Ok(x.clone());
    }
    let dtype = x.dtype();
    let accumulate = accumulation_dtype(dtype);
    let rows = x
        .to_dtype(accumulate)?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch * heads, seq_len, head_dim))?;

    let mut rotated = Vec::with_capacity(seq_len);
    for pos in 0..seq_len {
        let rotation_t = rotation_matrix_in(pos, cfg, x.device(), accumulate)?
            .t()?
            .contiguous()?;
        let features = rows.narrow(1, pos, 1)?.squeeze(1)?.contiguous()?;
        rotated.push(features.matmul(&rotation_t)?.unsqueeze(1)?);
    }

    let out = Tensor::cat(&rotated, 1)?
        .reshape((batch, heads, seq_len, head_dim))?
        .transpose(1, 2)?
        .contiguous()?
        .to_dtype(dtype)?;
    Ok(out)
}

/// Rotate `[batch, seq_len, num_heads, head_dim]` starting at absolute
/// position `pos_start`, using precomputed sine/cosine tables.
pub fn apply_rotary(x: &Tensor, cfg: &RopeConfig, pos_start: usize) -> Result<Tensor> {
    let (_batch, seq_len, _heads, head_dim) = sequence_major_dims(x, cfg)?;
    if seq_len == 0 {
        return Ok(x.clone());
    }
    let half_dim = head_dim / 2;
    let accumulate = accumulation_dtype(x.dtype());
    let (sin, cos) = get_sin_cos_with_dtype(pos_start + seq_len, cfg, x.device(), accumulate)?;
    let sin = sin.narrow(0, pos_start, seq_len)?.reshape((1, seq_len, 1, half_dim))?;
    let cos = cos.narrow(0, pos_start, seq_len)?.reshape((1, seq_len, 1, half_dim))?;
    rotate_pairs(x, &sin, &cos)
}

/// Apply rotary embeddings to head-major query/key tensors.
///
/// * `q` is `[batch, n_heads, seq_len, head_dim]`; `k` is
///   `[batch, n_kv_heads, seq_len, head_dim]`, so grouped layouts with fewer
///   key heads are accepted.
/// * `sin`/`cos` are tables shaped `[max_seq_len, head_dim / 2]` covering
///   `pos_start + seq_len` positions. `f32` tables from [`get_sin_cos`] suit
///   half and single precision; `f64` inputs need `f64` tables to keep full
///   precision.
/// * Outputs mirror the dtype of the inputs. Values are never rotated.
pub fn apply_rope_to_qk(
    q: &Tensor,
    k: &Tensor,
    pos_start: usize,
    cfg: &RopeConfig,
    sin: &Tensor,
    cos: &Tensor,
) -> Result<(Tensor, Tensor)> {
    cfg.validate()?;
    let (batch, _heads, seq_len, head_dim) = q.dims4().map_err(|_| {
        EmbeddingError::ShapeMismatch(format!(
            "q must be [batch, heads, seq_len, head_dim], got {:?}",
            q.dims()
        ))
    })?;
    let (kb, _kh, kt, kd) = k.dims4().map_err(|_| {
        EmbeddingError::ShapeMismatch(format!(
            "k must be [batch, heads, seq_len, head_dim], got {:?}",
            k.dims()
        ))
    })?;
    if (kb, kt, kd) != (batch, seq_len, head_dim) {
        return Err(EmbeddingError::ShapeMismatch(format!(
            "q/k shape mismatch: q={:?} k={:?}",
            q.dims(),
            k.dims()
        )));
    }
    if head_dim != cfg.head_dim {
        return Err(EmbeddingError::ShapeMismatch(format!(
            "input head_dim {head_dim} does not match configured head_dim {}",
            cfg.head_dim
        )));
    }

    let half_dim = head_dim / 2;
    let (sin_rows, sin_dim) = sin.dims2()?;
    let (cos_rows, cos_dim) = cos.dims2()?;
    let needed = pos_start + seq_len;
    if sin_rows < needed || cos_rows < needed {
        return Err(EmbeddingError::ShapeMismatch(format!(
            "sin/cos tables cover {} positions, need {needed}",
            sin_rows.min(cos_rows)
        )));
    }
    if sin_dim != half_dim || cos_dim != half_dim {
        return Err(EmbeddingError::ShapeMismatch(format!(
            "sin/cos tables have width {sin_dim}/{cos_dim}, expected {half_dim}"
        )));
    }

    let sin = sin.narrow(0, pos_start, seq_len)?.reshape((1, 1, seq_len, half_dim))?;
    let cos = cos.narrow(0, pos_start, seq_len)?.reshape((1, 1, seq_len, half_dim))?;
    let q_rot = rotate_pairs(q, &sin, &cos)?;
    let k_rot = rotate_pairs(k, &sin, &cos)?;
    Ok((q_rot, k_rot))
}

/// Rotate adjacent feature pairs of a rank-4 tensor. `sin`/`cos` must
/// broadcast against the tensor with its last axis halved.
fn rotate_pairs(tensor: &Tensor, sin: &Tensor, cos: &Tensor) -> Result<Tensor> {
    let (d0, d1, d2, head_dim) = tensor.dims4()?;
    let half_dim = head_dim / 2;
    let dtype = tensor.dtype();
    let accumulate = accumulation_dtype(dtype);
    let sin = sin.to_dtype(accumulate)?;
    let cos = cos.to_dtype(accumulate)?;

    let pairs = tensor
        .to_dtype(accumulate)?
        .reshape((d0, d1, d2, half_dim, 2))?;
    let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let rotated_even = even.broadcast_mul(&cos)?.sub(&odd.broadcast_mul(&sin)?)?;
    let rotated_odd = odd.broadcast_mul(&cos)?.add(&even.broadcast_mul(&sin)?)?;

    let rotated = Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
        .reshape((d0, d1, d2, head_dim))?
        .to_dtype(dtype)?;
    Ok(rotated)
}

/// Rotary positional embedding helper exposing construction and application entry points.
#[derive(Debug, Clone, PartialEq)]
pub struct Rope {
    config: RopeConfig,
}

impl Rope {
    /// Construct the rotary embedding helper from a configuration.
    pub fn new(config: RopeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Rotate a `[batch, seq_len, num_heads, head_dim]` tensor from position zero.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        apply_rotary(x, &self.config, 0)
    }

    /// Apply rotary positional embeddings to head-major query/key tensors.
    ///
    /// `positions` is a rank-1 `u32` tensor naming a contiguous range of
    /// absolute positions, one per sequence step.
    pub fn apply_rotary_embeddings(
        &self,
        query: &Tensor,
        key: &Tensor,
        positions: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        if !query.device().same_device(key.device()) {
            return Err(EmbeddingError::InvalidArgument(
                "query and key must live on the same device".to_string(),
            ));
        }
        if positions.rank() != 1 {
            return Err(EmbeddingError::ShapeMismatch(
                "positions tensor must be 1-D".to_string(),
            ));
        }
        let (_b, _h, seq_len, _d) = query.dims4()?;
        let pos_vec = positions.to_vec1::<u32>()?;
        if pos_vec.len() != seq_len {
            return Err(EmbeddingError::ShapeMismatch(format!(
                "positions length {} does not match sequence length {}",
                pos_vec.len(),
                seq_len
            )));
        }
        let Some(&first) = pos_vec.first() else {
            return Err(EmbeddingError::InvalidArgument(
                "positions tensor must not be empty".to_string(),
            ));
        };

        let pos_start = first as usize;
        for (offset, &position) in pos_vec.iter().enumerate() {
            if position as usize != pos_start + offset {
                return Err(EmbeddingError::InvalidArgument(format!(
                    "positions must form a contiguous range starting at {pos_start}"
                )));
            }
        }

        let (sin, cos) = get_sin_cos_with_dtype(
            pos_start + seq_len,
            &self.config,
            query.device(),
            accumulation_dtype(query.dtype()),
        )?;
        apply_rope_to_qk(query, key, pos_start, &self.config, &sin, &cos)
    }
}
