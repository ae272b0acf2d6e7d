//! Output shape inference for pooling.
//!
//! Rotary embedding needs none: its output is the input tensor itself.

use opk_core::{OpkError, Shape};
use smallvec::SmallVec;

/// Error returned when pooling parameters do not fit the input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("kernel, padding and stride lengths differ: {kernel}, {pads}, {strides}")]
    ParamLengthMismatch {
        kernel: usize,
        pads: usize,
        strides: usize,
    },

    #[error("input rank {rank} does not fit {spatial} spatial dims plus batch and channel")]
    RankMismatch { rank: usize, spatial: usize },

    #[error("{what} must be positive in spatial dim {dim}")]
    NonPositive { what: &'static str, dim: usize },

    #[error("kernel {kernel} larger than padded input {padded} in spatial dim {dim}")]
    WindowTooLarge {
        dim: usize,
        kernel: usize,
        padded: usize,
    },
}

impl From<ShapeError> for OpkError {
    fn from(e: ShapeError) -> Self {
        OpkError::InvalidArgument(e.to_string())
    }
}

/// Kernel, padding and stride of a pooling window, one entry per spatial dim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolParams {
    pub kernel: SmallVec<[usize; 3]>,
    pub pads: SmallVec<[usize; 3]>,
    pub strides: SmallVec<[usize; 3]>,
}

impl PoolParams {
    pub fn new(kernel: &[usize], pads: &[usize], strides: &[usize]) -> Self {
        Self {
            kernel: SmallVec::from_slice(kernel),
            pads: SmallVec::from_slice(pads),
            strides: SmallVec::from_slice(strides),
        }
    }

    /// Number of spatial dims, once lengths are known to agree.
    pub fn spatial_rank(&self) -> Result<usize, ShapeError> {
        let (k, p, s) = (self.kernel.len(), self.pads.len(), self.strides.len());
        if k != p || k != s {
            return Err(ShapeError::ParamLengthMismatch {
                kernel: k,
                pads: p,
                strides: s,
            });
        }
        Ok(k)
    }

    /// Parameters widened for the native call.
    pub fn as_i64(&self) -> [Vec<i64>; 3] {
        let widen = |v: &[usize]| v.iter().map(|&x| x as i64).collect();
        [widen(&self.kernel), widen(&self.pads), widen(&self.strides)]
    }
}

/// `out[i] = (X[i+2] + 2*P[i] - K[i]) / S[i] + 1`, batch and channel carried over.
pub fn pool_output_shape(input: &Shape, params: &PoolParams) -> Result<Shape, ShapeError> {
    let spatial = params.spatial_rank()?;
    let dims = input.dims();
    if spatial == 0 || dims.len() != spatial + 2 {
        return Err(ShapeError::RankMismatch {
            rank: dims.len(),
            spatial,
        });
    }

    let mut out: SmallVec<[usize; 6]> = SmallVec::from_slice(&dims[..2]);
    for d in 0..spatial {
        let (k, p, s) = (params.kernel[d], params.pads[d], params.strides[d]);
        if k == 0 {
            return Err(ShapeError::NonPositive { what: "kernel", dim: d });
        }
        if s == 0 {
            return Err(ShapeError::NonPositive { what: "stride", dim: d });
        }
        let padded = dims[d + 2] + 2 * p;
        if padded < k {
            return Err(ShapeError::WindowTooLarge {
                dim: d,
                kernel: k,
                padded,
            });
        }
        out.push((padded - k) / s + 1);
    }
    Ok(Shape(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_2x2_window() {
        let params = PoolParams::new(&[2, 2], &[1, 1], &[1, 1]);
        let out = pool_output_shape(&Shape::new([1, 1, 2, 2]), &params).unwrap();
        assert_eq!(out, Shape::new([1, 1, 3, 3]));
    }

    #[test]
    fn test_default_matrix_shapes() {
        let cases: [(&[usize], PoolParams, &[usize]); 3] = [
            (&[1, 1, 10], PoolParams::new(&[3], &[1], &[1]), &[1, 1, 10]),
            (
                &[32, 4, 224, 224],
                PoolParams::new(&[3, 3], &[1, 1], &[2, 2]),
                &[32, 4, 112, 112],
            ),
            (
                &[1, 1, 16, 16, 16],
                PoolParams::new(&[5, 5, 5], &[2, 2, 2], &[2, 2, 2]),
                &[1, 1, 8, 8, 8],
            ),
        ];
        for (input, params, expected) in cases {
            assert_eq!(
                pool_output_shape(&Shape::new(input), &params).unwrap(),
                Shape::new(expected)
            );
        }
    }

    #[test]
    fn test_padding_wider_than_half_kernel() {
        let params = PoolParams::new(&[1], &[1], &[1]);
        let out = pool_output_shape(&Shape::new([1, 1, 2]), &params).unwrap();
        assert_eq!(out, Shape::new([1, 1, 4]));
    }

    #[test]
    fn test_length_mismatch() {
        let params = PoolParams::new(&[2, 2], &[1], &[1, 1]);
        assert_eq!(
            pool_output_shape(&Shape::new([1, 1, 2, 2]), &params),
            Err(ShapeError::ParamLengthMismatch {
                kernel: 2,
                pads: 1,
                strides: 2
            })
        );
    }

    #[test]
    fn test_rank_mismatch() {
        let params = PoolParams::new(&[2], &[0], &[1]);
        assert!(matches!(
            pool_output_shape(&Shape::new([1, 1, 4, 4]), &params),
            Err(ShapeError::RankMismatch { rank: 4, spatial: 1 })
        ));
    }

    #[test]
    fn test_zero_stride() {
        let params = PoolParams::new(&[2], &[0], &[0]);
        assert!(matches!(
            pool_output_shape(&Shape::new([1, 1, 4]), &params),
            Err(ShapeError::NonPositive { what: "stride", .. })
        ));
    }

    #[test]
    fn test_converts_to_precondition() {
        let err: OpkError = ShapeError::RankMismatch { rank: 3, spatial: 2 }.into();
        assert_eq!(err.kind(), opk_core::ErrorKind::Precondition);
    }
}
