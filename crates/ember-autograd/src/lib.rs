//! # ember-autograd
//!
//! Define-by-run reverse-mode automatic differentiation.
//!
//! The graph is built as operations execute: [`function::apply`] runs an
//! operation's forward pass and, when recording is enabled, links a
//! [`FunctionNode`] between the input and output graph nodes. Calling
//! [`Variable::backward`] replays the recorded graph in decreasing rank
//! order, accumulating gradients across fan-out and fan-in.
//!
//! Highlights:
//! - `FunctionOp` trait for differentiable operations, with per-device
//!   forward variants and type-checked preconditions
//! - Weak producer→output references so dropped graphs are reclaimed
//! - `retain_inputs`/`retain_outputs` opt-in value retention for backward
//! - Thread-scoped `no_backprop_mode` / `force_backprop_mode`
//! - Process-wide debug mode that traps NaN/Inf at the producing operation

pub mod node;
pub mod variable;
pub mod function;
pub mod type_check;
mod backward;
pub mod scope;
pub mod debug;
pub mod ops;
pub mod error;

pub use node::VariableNode;
pub use variable::Variable;
pub use function::{apply, BackwardContext, ForwardContext, FunctionNode, FunctionOp};
pub use scope::{
    backprop_enabled, force_backprop_mode, no_backprop_mode, ForceBackpropGuard, NoBackpropGuard,
};
pub use debug::{is_debug, set_debug};
pub use error::{AutogradError, Phase, RetentionKind};

pub type Result<T> = std::result::Result<T, AutogradError>;
