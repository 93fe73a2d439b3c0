use std::fmt;

use thiserror::Error;

use ember_core::{CoreError, Device};

/// Which half of an operation's lifecycle an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Backward,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Forward => write!(f, "Forward"),
            Phase::Backward => write!(f, "Backward"),
        }
    }
}

/// Whether a retention violation was on the input or output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionKind {
    Input,
    Output,
}

impl fmt::Display for RetentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionKind::Input => write!(f, "input"),
            RetentionKind::Output => write!(f, "output"),
        }
    }
}

/// Errors from the graph engine.
///
/// All of these surface to the caller of `apply`/`backward`; nothing is
/// retried internally, and a failed `apply` leaves the graph untouched.
#[derive(Debug, Error)]
pub enum AutogradError {
    /// Type-check precondition failure, raised before any forward
    /// computation touches the data.
    #[error(
        "Invalid operation is performed in: {label} ({phase})\n\nExpect: {expect}\nActual: {actual}"
    )]
    InvalidType {
        label: String,
        phase: Phase,
        expect: String,
        actual: String,
    },

    /// A backward implementation asked for an input/output position it
    /// never declared via `retain_inputs`/`retain_outputs`.
    #[error("{kind} {index} of {label} was not retained during forward")]
    RetentionViolation {
        label: String,
        kind: RetentionKind,
        index: usize,
    },

    /// Debug mode found a NaN or Inf in a produced value.
    #[error("{label} produced a non-finite value in {phase} output {index}")]
    DebugValidation {
        label: String,
        phase: Phase,
        index: usize,
    },

    /// `backward` returned a gradient count inconsistent with the
    /// requested input indices.
    #[error("{label} backward returned {actual} gradients, expected {expected}")]
    ArityMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },

    /// No forward kernel is registered for the inputs' device.
    #[error("no {device} kernel registered for {label}")]
    NoKernel { label: String, device: Device },

    /// A node's value has been pruned (or its producer unchained) and is
    /// no longer available.
    #[error("variable data is gone (pruned or unchained)")]
    MissingData,

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_type_message_shape() {
        let err = AutogradError::InvalidType {
            label: "FunctionNode".to_string(),
            phase: Phase::Forward,
            expect: "in_types[0].ndim >= 2".to_string(),
            actual: "1 < 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid operation is performed in: FunctionNode (Forward)\n\n\
             Expect: in_types[0].ndim >= 2\nActual: 1 < 2"
        );
    }

    #[test]
    fn test_core_error_wraps() {
        let core = CoreError::UnsupportedDType(ember_core::DType::I32);
        let err: AutogradError = core.into();
        assert!(err.to_string().contains("unsupported dtype"));
    }
}
