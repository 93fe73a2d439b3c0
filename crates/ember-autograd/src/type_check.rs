//! Input type checking for operations.
//!
//! Before an operation's forward runs, its `check_type_forward` receives a
//! tuple of lightweight descriptors (shape + dtype, no data) and evaluates
//! whatever preconditions it declares. A failed expectation carries both
//! the textual predicate ("Expect: …") and the observed values
//! ("Actual: …"); `apply` wraps it into an `InvalidType` error naming the
//! operation and phase.

use std::ops::Index;

use ember_core::{Array, DType, Shape};

/// A failed type expectation: the predicate text and the observed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCheckFailure {
    pub expect: String,
    pub actual: String,
}

pub type TypeCheckResult<T = ()> = std::result::Result<T, TypeCheckFailure>;

/// General-purpose expectation: fail with the given texts if `cond` is false.
pub fn expect(
    cond: bool,
    expect: impl Into<String>,
    actual: impl Into<String>,
) -> TypeCheckResult {
    if cond {
        Ok(())
    } else {
        Err(TypeCheckFailure {
            expect: expect.into(),
            actual: actual.into(),
        })
    }
}

/// Descriptor of one input: its position, shape, and dtype.
///
/// The position is kept so failure text reads `in_types[i].…`, pointing at
/// the offending argument.
#[derive(Debug, Clone)]
pub struct InType {
    index: usize,
    shape: Shape,
    dtype: DType,
}

impl InType {
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Expect this input to have exactly the given dtype.
    pub fn expect_dtype(&self, want: DType) -> TypeCheckResult {
        expect(
            self.dtype == want,
            format!("in_types[{}].dtype == {}", self.index, want),
            format!("{} != {}", self.dtype, want),
        )
    }

    /// Expect this input to be a floating-point array.
    pub fn expect_float(&self) -> TypeCheckResult {
        expect(
            self.dtype.is_float(),
            format!("in_types[{}].dtype is float", self.index),
            format!("{} is not float", self.dtype),
        )
    }

    /// Expect this input to have exactly `want` dimensions.
    pub fn expect_ndim(&self, want: usize) -> TypeCheckResult {
        expect(
            self.ndim() == want,
            format!("in_types[{}].ndim == {}", self.index, want),
            format!("{} != {}", self.ndim(), want),
        )
    }

    /// Expect this input to have at least `min` dimensions.
    pub fn expect_ndim_at_least(&self, min: usize) -> TypeCheckResult {
        expect(
            self.ndim() >= min,
            format!("in_types[{}].ndim >= {}", self.index, min),
            format!("{} < {}", self.ndim(), min),
        )
    }

    /// Expect this input to have exactly the given shape.
    pub fn expect_shape(&self, dims: &[usize]) -> TypeCheckResult {
        let want = Shape::new(dims);
        expect(
            self.shape == want,
            format!("in_types[{}].shape == {}", self.index, want),
            format!("{} != {}", self.shape, want),
        )
    }
}

/// Ordered descriptors for all inputs of one `apply` call.
#[derive(Debug, Clone)]
pub struct InTypes {
    types: Vec<InType>,
}

impl InTypes {
    pub(crate) fn from_arrays(arrays: &[Array]) -> Self {
        Self {
            types: arrays
                .iter()
                .enumerate()
                .map(|(index, a)| InType {
                    index,
                    shape: a.shape().clone(),
                    dtype: a.dtype(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InType> {
        self.types.iter()
    }

    /// Expect exactly `want` inputs.
    pub fn expect_arity(&self, want: usize) -> TypeCheckResult {
        expect(
            self.len() == want,
            format!("len(in_types) == {want}"),
            format!("{} != {}", self.len(), want),
        )
    }

    /// Expect inputs `a` and `b` to share a dtype.
    pub fn expect_same_dtype(&self, a: usize, b: usize) -> TypeCheckResult {
        expect(
            self.types[a].dtype == self.types[b].dtype,
            format!("in_types[{a}].dtype == in_types[{b}].dtype"),
            format!("{} != {}", self.types[a].dtype, self.types[b].dtype),
        )
    }

    /// Expect inputs `a` and `b` to share a shape.
    pub fn expect_same_shape(&self, a: usize, b: usize) -> TypeCheckResult {
        expect(
            self.types[a].shape == self.types[b].shape,
            format!("in_types[{a}].shape == in_types[{b}].shape"),
            format!("{} != {}", self.types[a].shape, self.types[b].shape),
        )
    }
}

impl Index<usize> for InTypes {
    type Output = InType;

    fn index(&self, index: usize) -> &InType {
        &self.types[index]
    }
}
