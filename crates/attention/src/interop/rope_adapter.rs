//! Integration with the rotary position embedding utilities.
//!
//! The adapter exposes helpers to (a) fetch sine/cosine tables covering a
//! contiguous span of positions, and (b) apply rotary embeddings to tensors
//! laid out as `[batch, num_heads, seq_len, head_dim]`. Tables are owned by
//! the adapter and grow on demand; nothing is shared between adapters.
//! Tables follow the accumulation dtype of the rotated tensors, so `f64`
//! inputs are rotated with `f64` tables.

use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::{apply_rope_to_qk, get_sin_cos_with_dtype, RopeConfig};
use embedding::{EmbeddingError, Result};

use crate::core::shape::accumulation_dtype;

#[derive(Debug, Clone)]
struct CachedTables {
    coverage: usize,
    dtype: DType,
    sin: Tensor,
    cos: Tensor,
}

/// Adapter that bridges attention kernels with the positional embedding crate.
#[derive(Debug, Clone)]
pub struct RopeAdapter {
    config: RopeConfig,
    device: Device,
    tables: Option<CachedTables>,
}

impl RopeAdapter {
    /// Create a new adapter bound to the provided configuration and device.
    pub fn new(config: RopeConfig, device: Device) -> Self {
        Self {
            config,
            device,
            tables: None,
        }
    }

    /// Number of positions the current tables cover.
    pub fn coverage(&self) -> usize {
        self.tables.as_ref().map(|c| c.coverage).unwrap_or(0)
    }

    /// The device the adapter builds its tables on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Retrieve f32 sine/cosine tables covering the contiguous span starting
    /// at `pos_start` and extending `seq_len` positions.
    pub fn sin_cos_slice(&mut self, pos_start: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
        if seq_len == 0 {
            return Err(EmbeddingError::InvalidArgument(
                "seq_len must be non-zero".to_string(),
            ));
        }
        let tables = self.ensure_tables(pos_start + seq_len, DType::F32)?;
        let sin_slice = tables.sin.narrow(0, pos_start, seq_len)?;
        let cos_slice = tables.cos.narrow(0, pos_start, seq_len)?;
        Ok((sin_slice, cos_slice))
    }

    /// Apply rotary embeddings to query/key tensors shaped
    /// `[batch, num_heads, seq_len, head_dim]` (keys may carry fewer heads).
    ///
    /// Both tensors must reside on the adapter's device and cover positions
    /// `[pos_start, pos_start + seq_len)`.
    pub fn apply(&mut self, q: &Tensor, k: &Tensor, pos_start: usize) -> Result<(Tensor, Tensor)> {
        if !self.device.same_device(q.device()) || !self.device.same_device(k.device()) {
            return Err(EmbeddingError::InvalidArgument(
                "q and k must reside on the adapter's device".to_string(),
            ));
        }

        let (_b, _h, seq_len, _d) = q.dims4()?;
        if seq_len == 0 {
            return Err(EmbeddingError::InvalidArgument(
                "sequence length must be non-zero".to_string(),
            ));
        }
        let config = self.config.clone();
        let tables = self.ensure_tables(pos_start + seq_len, accumulation_dtype(q.dtype()))?;
        apply_rope_to_qk(q, k, pos_start, &config, &tables.sin, &tables.cos)
    }

    fn ensure_tables(&mut self, required: usize, dtype: DType) -> Result<&CachedTables> {
        let reusable = self
            .tables
            .as_ref()
            .is_some_and(|t| t.coverage >= required && t.dtype == dtype);
        if !reusable {
            let coverage = required.max(self.coverage());
            log::debug!(
                "rope adapter building {:?} tables: {} -> {} positions",
                dtype,
                self.coverage(),
                coverage
            );
            let (sin, cos) = get_sin_cos_with_dtype(coverage, &self.config, &self.device, dtype)?;
            self.tables = Some(CachedTables {
                coverage,
                dtype,
                sin,
                cos,
            });
        }
        self.tables.as_ref().ok_or_else(|| {
            EmbeddingError::InvalidArgument("rotary tables unavailable".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedding::positional::rope::{apply_rotary, get_sin_cos};

    fn arange_tensor(total: usize, shape: (usize, usize, usize, usize), device: &Device) -> Tensor {
        let data: Vec<f32> = (0..total).map(|v| v as f32).collect();
        Tensor::from_vec(data, shape, device).unwrap()
    }

    fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> bool {
        let diff = a
            .sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        diff.into_iter().fold(0.0_f32, f32::max) <= tol
    }

    #[test]
    fn adapter_matches_direct_application() -> Result<()> {
        let device = Device::Cpu;
        let cfg = RopeConfig::new(8);

        let (batch, heads, seq_len) = (2, 3, 4);
        let total = batch * heads * seq_len * cfg.head_dim;
        let q = arange_tensor(total, (batch, heads, seq_len, cfg.head_dim), &device);
        let k = arange_tensor(total, (batch, heads, seq_len, cfg.head_dim), &device);

        let (sin, cos) = get_sin_cos(seq_len, &cfg, &device)?;
        let (direct_q, direct_k) = apply_rope_to_qk(&q, &k, 0, &cfg, &sin, &cos)?;

        let mut adapter = RopeAdapter::new(cfg.clone(), device.clone());
        let (adapt_q, adapt_k) = adapter.apply(&q, &k, 0)?;

        assert!(allclose(&direct_q, &adapt_q, 1e-5));
        assert!(allclose(&direct_k, &adapt_k, 1e-5));
        Ok(())
    }

    #[test]
    fn adapter_handles_offset_positions() -> Result<()> {
        let device = Device::Cpu;
        let cfg = RopeConfig::new(8);

        let (batch, heads, seq_len) = (1, 2, 3);
        let total = batch * heads * seq_len * cfg.head_dim;
        let q = arange_tensor(total, (batch, heads, seq_len, cfg.head_dim), &device);

        let pos_start = 5;
        let (sin, cos) = get_sin_cos(pos_start + seq_len, &cfg, &device)?;
        let (direct_q, _) = apply_rope_to_qk(&q, &q, pos_start, &cfg, &sin, &cos)?;

        let mut adapter = RopeAdapter::new(cfg.clone(), device.clone());
        let (adapt_q, _) = adapter.apply(&q, &q, pos_start)?;
        assert!(allclose(&direct_q, &adapt_q, 1e-5));

        let (slice_sin, slice_cos) = adapter.sin_cos_slice(pos_start, seq_len)?;
        assert!(allclose(&slice_sin, &sin.narrow(0, pos_start, seq_len)?, 1e-6));
        assert!(allclose(&slice_cos, &cos.narrow(0, pos_start, seq_len)?, 1e-6));
        Ok(())
    }

    #[test]
    fn adapter_extends_cached_tables_on_demand() -> Result<()> {
        let device = Device::Cpu;
        let cfg = RopeConfig::new(8);

        let mut adapter = RopeAdapter::new(cfg.clone(), device);
        assert_eq!(adapter.coverage(), 0);
        let (sin_short, _) = adapter.sin_cos_slice(0, 2)?;
        assert_eq!(sin_short.dims(), &[2, cfg.head_dim / 2]);
        assert_eq!(adapter.coverage(), 2);

        let (sin_long, _) = adapter.sin_cos_slice(0, 8)?;
        assert_eq!(sin_long.dims(), &[8, cfg.head_dim / 2]);
        assert_eq!(adapter.coverage(), 8);

        // Shorter requests reuse the grown tables.
        adapter.sin_cos_slice(1, 3)?;
        assert_eq!(adapter.coverage(), 8);
        Ok(())
    }

    #[test]
    fn double_precision_inputs_use_double_tables() -> Result<()> {
        let device = Device::Cpu;
        let cfg = RopeConfig::new(4);
        let data: Vec<f64> = (0..2 * 3 * 4).map(|v| (v as f64 * 0.21).cos()).collect();
        let q = Tensor::from_vec(data, (1, 2, 3, 4), &device)?;

        let mut adapter = RopeAdapter::new(cfg.clone(), device);
        adapter.sin_cos_slice(0, 3)?;
        let (rotated, _) = adapter.apply(&q, &q, 0)?;
        assert_eq!(rotated.dtype(), DType::F64);
        assert_eq!(adapter.coverage(), 3);

        let expected = apply_rotary(&q.transpose(1, 2)?.contiguous()?, &cfg, 0)?
            .transpose(1, 2)?
            .contiguous()?;
        let diff = rotated
            .sub(&expected)?
            .abs()?
            .max_all()?
            .to_scalar::<f64>()?;
        assert!(diff < 1e-12, "adapter rotation differs by {diff}");
        Ok(())
    }

    #[test]
    fn adapter_rejects_empty_spans() {
        let mut adapter = RopeAdapter::new(RopeConfig::new(4), Device::Cpu);
        assert!(adapter.sin_cos_slice(0, 0).is_err());
    }
}
