//! # ember-core
//!
//! Array value type for the Ember autodiff engine.
//!
//! Provides the numeric building blocks the graph engine treats as opaque:
//! - `Array`: a dense multi-dimensional value with dtype and device tag
//! - `DType` / `Shape` / `Device` introspection
//! - Elementwise arithmetic and NaN/Inf probing
//!
//! The graph engine (`ember-autograd`) never looks inside an `Array` beyond
//! this interface; concrete kernels for the accelerated device live outside
//! this workspace.

pub mod dtype;
pub mod shape;
pub mod device;
pub mod array;
pub mod error;

pub use dtype::DType;
pub use shape::Shape;
pub use device::Device;
pub use array::Array;
pub use error::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
