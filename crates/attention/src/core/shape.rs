//! Shape contracts shared by the attention entry points.

use candle_core::{DType, Tensor};

use super::AttentionError;

/// Logical geometry of one grouped attention invocation.
///
/// Query heads outnumber (or equal) key/value heads; every key/value head
/// serves [`group_size`](Self::group_size) consecutive query heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    /// Query sequence length.
    pub q_len: usize,
    /// Key/value sequence length.
    pub kv_len: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

#[derive(Debug, Clone, Copy)]
struct Dims {
    batch: usize,
    seq: usize,
    heads: usize,
    dim: usize,
}

impl AttentionShape {
    /// Query heads served by each key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Validate sequence-major inputs: `q` is `[batch, seq_len, num_heads,
    /// head_dim]`, `k`/`v` are `[batch, kv_seq_len, num_kv_heads, head_dim]`.
    pub fn sequence_major(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        let read = |t: &Tensor, name: &str| -> Result<Dims, AttentionError> {
            let (batch, seq, heads, dim) = dims4(t, name, "[batch, seq_len, heads, head_dim]")?;
            Ok(Dims { batch, seq, heads, dim })
        };
        Self::resolve(read(q, "query")?, read(k, "key")?, read(v, "value")?)
    }

    /// Validate head-major inputs: `q` is `[batch, num_heads, seq_len,
    /// head_dim]`, `k`/`v` are `[batch, num_kv_heads, kv_seq_len, head_dim]`.
    pub fn head_major(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        let read = |t: &Tensor, name: &str| -> Result<Dims, AttentionError> {
            let (batch, heads, seq, dim) = dims4(t, name, "[batch, heads, seq_len, head_dim]")?;
            Ok(Dims { batch, seq, heads, dim })
        };
        Self::resolve(read(q, "query")?, read(k, "key")?, read(v, "value")?)
    }

    fn resolve(q: Dims, k: Dims, v: Dims) -> Result<Self, AttentionError> {
        if k.heads == 0 || q.heads % k.heads != 0 {
            return Err(AttentionError::invalid(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                q.heads, k.heads
            )));
        }
        if (k.batch, k.seq, k.heads, k.dim) != (v.batch, v.seq, v.heads, v.dim) {
            return Err(AttentionError::shape(format!(
                "key {:?} and value {:?} must share [batch, seq_len, heads, head_dim]",
                k, v
            )));
        }
        if k.batch != q.batch {
            return Err(AttentionError::shape(format!(
                "batch mismatch: query {} vs key/value {}",
                q.batch, k.batch
            )));
        }
        if k.dim != q.dim {
            return Err(AttentionError::shape(format!(
                "head_dim mismatch: query {} vs key/value {}",
                q.dim, k.dim
            )));
        }
        if q.seq == 0 || k.seq == 0 || q.dim == 0 {
            return Err(AttentionError::shape(format!(
                "sequence lengths and head_dim must be non-zero (q_len={}, kv_len={}, head_dim={})",
                q.seq, k.seq, q.dim
            )));
        }
        Ok(Self {
            batch: q.batch,
            q_len: q.seq,
            kv_len: k.seq,
            num_heads: q.heads,
            num_kv_heads: k.heads,
            head_dim: q.dim,
        })
    }
}

pub(crate) fn dims3(
    t: &Tensor,
    name: &str,
) -> Result<(usize, usize, usize), AttentionError> {
    t.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must have shape [batch, seq_len, hidden_dim], got {:?}",
            t.dims()
        ))
    })
}

pub(crate) fn dims4(
    t: &Tensor,
    name: &str,
    layout: &str,
) -> Result<(usize, usize, usize, usize), AttentionError> {
    t.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must have shape {layout}, got {:?}",
            t.dims()
        ))
    })
}

/// Dtype for reductions over `dtype` inputs: half precision widens to `f32`,
/// `f32` and `f64` are kept.
pub(crate) fn accumulation_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

/// All tensors of one call share a single floating-point dtype.
pub(crate) fn ensure_float_dtype(tensors: &[&Tensor]) -> Result<DType, AttentionError> {
    let Some(first) = tensors.first() else {
        return Err(AttentionError::invalid("no tensors supplied"));
    };
    let dtype = first.dtype();
    if !matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    if let Some(other) = tensors.iter().find(|t| t.dtype() != dtype) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mixed precision {dtype:?} and {:?}", other.dtype()),
        });
    }
    Ok(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn zeros(shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn resolves_grouped_geometry() {
        let shape =
            AttentionShape::sequence_major(&zeros((2, 5, 8, 4)), &zeros((2, 7, 2, 4)), &zeros((2, 7, 2, 4)))
                .unwrap();
        assert_eq!(shape.q_len, 5);
        assert_eq!(shape.kv_len, 7);
        assert_eq!(shape.group_size(), 4);

        let shape =
            AttentionShape::head_major(&zeros((2, 8, 5, 4)), &zeros((2, 2, 7, 4)), &zeros((2, 2, 7, 4)))
                .unwrap();
        assert_eq!(shape.num_kv_heads, 2);
        assert_eq!(shape.kv_len, 7);
    }

    #[test]
    fn indivisible_heads_are_invalid_arguments() {
        let err =
            AttentionShape::sequence_major(&zeros((1, 2, 6, 4)), &zeros((1, 2, 4, 4)), &zeros((1, 2, 4, 4)))
                .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidArgument { .. }));
    }

    #[test]
    fn head_dim_disagreement_is_shape_mismatch() {
        let err =
            AttentionShape::sequence_major(&zeros((1, 2, 4, 4)), &zeros((1, 2, 2, 8)), &zeros((1, 2, 2, 8)))
                .unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    }

    #[test]
    fn accumulation_never_narrows() {
        assert_eq!(accumulation_dtype(DType::F16), DType::F32);
        assert_eq!(accumulation_dtype(DType::BF16), DType::F32);
        assert_eq!(accumulation_dtype(DType::F32), DType::F32);
        assert_eq!(accumulation_dtype(DType::F64), DType::F64);
    }

    #[test]
    fn mixed_dtypes_are_rejected() {
        let a = zeros((1, 1, 1, 2));
        let b = a.to_dtype(DType::F16).unwrap();
        let err = ensure_float_dtype(&[&a, &b]).unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
        let ints = Tensor::zeros((1, 2), DType::U32, &Device::Cpu).unwrap();
        assert!(ensure_float_dtype(&[&ints]).is_err());
    }
}
