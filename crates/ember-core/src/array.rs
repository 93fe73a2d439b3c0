use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::dtype::DType;
use crate::error::CoreError;
use crate::shape::Shape;
use crate::Result;

/// Typed, reference-counted element buffer.
///
/// `Arc`-shared so cloning an array (or stashing it for backward) never
/// copies the elements.
#[derive(Debug, Clone)]
enum Buffer {
    F32(Arc<Vec<f32>>),
    F64(Arc<Vec<f64>>),
    I32(Arc<Vec<i32>>),
    I64(Arc<Vec<i64>>),
}

impl Buffer {
    fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::I32(_) => DType::I32,
            Buffer::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
            Buffer::I32(v) => v.len(),
            Buffer::I64(v) => v.len(),
        }
    }
}

/// A dense multi-dimensional value — the opaque numeric type the graph
/// engine records and differentiates.
///
/// Arrays carry a device tag so the engine can dispatch each operation to
/// the matching backend. Moving an array between devices is a copy with a
/// retag; the accelerated backend's real storage is outside this crate.
///
/// # Examples
///
/// ```
/// use ember_core::Array;
///
/// let a = Array::from_f32(&[1.0, 2.0, 3.0], &[3]).unwrap();
/// let b = Array::arange(3);
/// let sum = a.add(&b).unwrap();
/// assert_eq!(sum.as_f32_slice().unwrap(), &[1.0, 3.0, 5.0]);
/// ```
#[derive(Clone)]
pub struct Array {
    buffer: Buffer,
    shape: Shape,
    device: Device,
}

impl Array {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create an array from f32 data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Result<Self> {
        Self::build(Buffer::F32(Arc::new(data.to_vec())), shape)
    }

    /// Create an array from f64 data with the given shape.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Result<Self> {
        Self::build(Buffer::F64(Arc::new(data.to_vec())), shape)
    }

    /// Create an array from i32 data with the given shape.
    pub fn from_i32(data: &[i32], shape: &[usize]) -> Result<Self> {
        Self::build(Buffer::I32(Arc::new(data.to_vec())), shape)
    }

    /// Create an array from i64 data with the given shape.
    pub fn from_i64(data: &[i64], shape: &[usize]) -> Result<Self> {
        Self::build(Buffer::I64(Arc::new(data.to_vec())), shape)
    }

    fn build(buffer: Buffer, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != buffer.len() {
            return Err(CoreError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![buffer.len()],
            });
        }
        Ok(Self {
            buffer,
            shape: s,
            device: Device::Host,
        })
    }

    /// 1-D f32 array `[0, 1, …, n-1]`.
    pub fn arange(n: usize) -> Self {
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        Self {
            buffer: Buffer::F32(Arc::new(data)),
            shape: Shape::new(&[n]),
            device: Device::Host,
        }
    }

    /// Array of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full_value(shape, dtype, 0.0)
    }

    /// Array of ones with the given shape and dtype.
    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full_value(shape, dtype, 1.0)
    }

    /// f32 array filled with a constant.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        let data = vec![value; s.numel()];
        Self {
            buffer: Buffer::F32(Arc::new(data)),
            shape: s,
            device: Device::Host,
        }
    }

    /// 0-dimensional f32 array.
    pub fn scalar(value: f32) -> Self {
        Self {
            buffer: Buffer::F32(Arc::new(vec![value])),
            shape: Shape::scalar(),
            device: Device::Host,
        }
    }

    /// Ones with the same shape, dtype, and device as `other`.
    pub fn ones_like(other: &Array) -> Self {
        let mut out = Self::full_value(other.shape.dims(), other.dtype(), 1.0);
        out.device = other.device;
        out
    }

    fn full_value(shape: &[usize], dtype: DType, value: f64) -> Self {
        let s = Shape::new(shape);
        let n = s.numel();
        let buffer = match dtype {
            DType::F32 => Buffer::F32(Arc::new(vec![value as f32; n])),
            DType::F64 => Buffer::F64(Arc::new(vec![value; n])),
            DType::I32 => Buffer::I32(Arc::new(vec![value as i32; n])),
            DType::I64 => Buffer::I64(Arc::new(vec![value as i64; n])),
        };
        Self {
            buffer,
            shape: s,
            device: Device::Host,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Shape of the array.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Data type of the elements.
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// Device tag.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Whether any element is NaN or infinite. Always false for integers.
    pub fn has_non_finite(&self) -> bool {
        match &self.buffer {
            Buffer::F32(v) => v.iter().any(|x| !x.is_finite()),
            Buffer::F64(v) => v.iter().any(|x| !x.is_finite()),
            Buffer::I32(_) | Buffer::I64(_) => false,
        }
    }

    // =========================================================================
    // Element access
    // =========================================================================

    /// View elements as f32, if this is an F32 array.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match &self.buffer {
            Buffer::F32(v) => Some(v),
            _ => None,
        }
    }

    /// View elements as f64, if this is an F64 array.
    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match &self.buffer {
            Buffer::F64(v) => Some(v),
            _ => None,
        }
    }

    /// View elements as i32, if this is an I32 array.
    pub fn as_i32_slice(&self) -> Option<&[i32]> {
        match &self.buffer {
            Buffer::I32(v) => Some(v),
            _ => None,
        }
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Array) -> Result<Array> {
        self.binary_op(other, |a, b| a + b, |a, b| a + b)
    }

    /// Element-wise multiplication: self * other.
    pub fn mul(&self, other: &Array) -> Result<Array> {
        self.binary_op(other, |a, b| a * b, |a, b| a * b)
    }

    /// Scalar addition: self + value (float dtypes only).
    pub fn add_scalar(&self, value: f64) -> Result<Array> {
        let buffer = match &self.buffer {
            Buffer::F32(v) => {
                Buffer::F32(Arc::new(v.iter().map(|a| a + value as f32).collect()))
            }
            Buffer::F64(v) => Buffer::F64(Arc::new(v.iter().map(|a| a + value).collect())),
            _ => return Err(CoreError::UnsupportedDType(self.dtype())),
        };
        Ok(Self {
            buffer,
            shape: self.shape.clone(),
            device: self.device,
        })
    }

    fn binary_op(
        &self,
        other: &Array,
        float_op: impl Fn(f64, f64) -> f64,
        int_op: impl Fn(i64, i64) -> i64,
    ) -> Result<Array> {
        if self.shape != other.shape {
            return Err(CoreError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: other.shape.dims().to_vec(),
            });
        }
        if self.device != other.device {
            return Err(CoreError::DeviceMismatch {
                lhs: self.device,
                rhs: other.device,
            });
        }
        let buffer = match (&self.buffer, &other.buffer) {
            (Buffer::F32(a), Buffer::F32(b)) => Buffer::F32(Arc::new(
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| float_op(*x as f64, *y as f64) as f32)
                    .collect(),
            )),
            (Buffer::F64(a), Buffer::F64(b)) => Buffer::F64(Arc::new(
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| float_op(*x, *y))
                    .collect(),
            )),
            (Buffer::I32(a), Buffer::I32(b)) => Buffer::I32(Arc::new(
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| int_op(*x as i64, *y as i64) as i32)
                    .collect(),
            )),
            (Buffer::I64(a), Buffer::I64(b)) => Buffer::I64(Arc::new(
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| int_op(*x, *y))
                    .collect(),
            )),
            _ => {
                return Err(CoreError::DTypeMismatch {
                    lhs: self.dtype(),
                    rhs: other.dtype(),
                })
            }
        };
        Ok(Self {
            buffer,
            shape: self.shape.clone(),
            device: self.device,
        })
    }

    // =========================================================================
    // Device movement
    // =========================================================================

    /// Copy to the given device. A no-op clone if already there.
    pub fn to_device(&self, device: Device) -> Array {
        let mut out = self.clone();
        out.device = device;
        out
    }

    /// Copy to the host device.
    pub fn to_host(&self) -> Array {
        self.to_device(Device::Host)
    }

    /// Copy to the accelerated device.
    pub fn to_accel(&self) -> Array {
        self.to_device(Device::Accel)
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        if self.shape != other.shape || self.device != other.device {
            return false;
        }
        match (&self.buffer, &other.buffer) {
            (Buffer::F32(a), Buffer::F32(b)) => a == b,
            (Buffer::F64(a), Buffer::F64(b)) => a == b,
            (Buffer::I32(a), Buffer::I32(b)) => a == b,
            (Buffer::I64(a), Buffer::I64(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("dtype", &self.dtype())
            .field("shape", &self.shape)
            .field("device", &self.device)
            .finish()
    }
}
