use thiserror::Error;

use crate::device::Device;
use crate::dtype::DType;

/// Errors from the array layer.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("dtype mismatch: {lhs} vs {rhs}")]
    DTypeMismatch { lhs: DType, rhs: DType },

    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: Device, rhs: Device },

    #[error("unsupported dtype {0} for this operation")]
    UnsupportedDType(DType),
}
