//! End-to-end engine behavior: dispatch, type-check messages, debug mode,
//! recording scopes, and retention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ember_autograd::ops::add_scalar;
use ember_autograd::type_check::{InTypes, TypeCheckResult};
use ember_autograd::{
    apply, is_debug, no_backprop_mode, set_debug, AutogradError, BackwardContext, ForwardContext,
    FunctionOp, Phase, RetentionKind, Result, Variable,
};
use ember_core::{Array, DType, Device};

/// Serializes tests that touch the process-wide debug flag.
static DEBUG_LOCK: Mutex<()> = Mutex::new(());

fn debug_guard() -> std::sync::MutexGuard<'static, ()> {
    DEBUG_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Backend dispatch
// =============================================================================

struct CountingOp {
    host_calls: Arc<AtomicUsize>,
    accel_calls: Arc<AtomicUsize>,
}

impl FunctionOp for CountingOp {
    fn label(&self) -> &str {
        "CountingOp"
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        Ok(inputs.to_vec())
    }

    fn forward_accel(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        self.accel_calls.fetch_add(1, Ordering::Relaxed);
        Ok(inputs.to_vec())
    }
}

/// Host-only operation: relies on the default accel implementation.
struct HostOnly;

impl FunctionOp for HostOnly {
    fn label(&self) -> &str {
        "HostOnly"
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(inputs.to_vec())
    }
}

#[test]
fn host_input_dispatches_only_to_host_variant() {
    let host = Arc::new(AtomicUsize::new(0));
    let accel = Arc::new(AtomicUsize::new(0));
    let op = CountingOp {
        host_calls: Arc::clone(&host),
        accel_calls: Arc::clone(&accel),
    };

    let x = Variable::new(Array::arange(3));
    apply(op, &[x]).unwrap();
    assert_eq!(host.load(Ordering::Relaxed), 1);
    assert_eq!(accel.load(Ordering::Relaxed), 0);
}

#[test]
fn accel_input_dispatches_only_to_accel_variant() {
    let host = Arc::new(AtomicUsize::new(0));
    let accel = Arc::new(AtomicUsize::new(0));
    let op = CountingOp {
        host_calls: Arc::clone(&host),
        accel_calls: Arc::clone(&accel),
    };

    let x = Variable::new(Array::arange(3).to_accel());
    apply(op, &[x]).unwrap();
    assert_eq!(host.load(Ordering::Relaxed), 0);
    assert_eq!(accel.load(Ordering::Relaxed), 1);
}

#[test]
fn missing_accel_kernel_is_an_error() {
    let x = Variable::new(Array::arange(3).to_accel());
    let err = apply(HostOnly, &[x]).unwrap_err();
    assert!(matches!(
        err,
        AutogradError::NoKernel {
            device: Device::Accel,
            ..
        }
    ));
}

// =============================================================================
// Type-check failure messages
// =============================================================================

/// Expects a float32 input with at least two dimensions, like the original
/// precondition this message format comes from.
struct StrictInput;

impl FunctionOp for StrictInput {
    fn check_type_forward(&self, in_types: &InTypes) -> TypeCheckResult {
        in_types.expect_arity(1)?;
        in_types[0].expect_dtype(DType::F32)?;
        in_types[0].expect_ndim_at_least(2)
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(inputs.to_vec())
    }
}

#[test]
fn valid_input_passes_type_check() {
    let v = Variable::new(Array::from_f32(&[0.0; 5], &[1, 5]).unwrap());
    let ys = apply(StrictInput, &[v]).unwrap();
    assert_eq!(ys.len(), 1);
}

#[test]
fn wrong_dtype_message_is_exact() {
    let v = Variable::new(Array::from_f64(&[0.0; 5], &[1, 5]).unwrap());
    let err = apply(StrictInput, &[v]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid operation is performed in: FunctionNode (Forward)\n\n\
         Expect: in_types[0].dtype == f32\nActual: f64 != f32"
    );
}

#[test]
fn wrong_ndim_message_is_exact() {
    let v = Variable::new(Array::from_f32(&[0.0; 5], &[5]).unwrap());
    let err = apply(StrictInput, &[v]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid operation is performed in: FunctionNode (Forward)\n\n\
         Expect: in_types[0].ndim >= 2\nActual: 1 < 2"
    );
}

// =============================================================================
// Debug mode
// =============================================================================

struct EmitNan;

impl FunctionOp for EmitNan {
    fn label(&self) -> &str {
        "EmitNan"
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, _inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(vec![Array::from_f32(&[f32::NAN], &[1]).unwrap()])
    }
}

struct EmitInt;

impl FunctionOp for EmitInt {
    fn forward_host(&self, _ctx: &mut ForwardContext, _inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(vec![Array::from_i32(&[1], &[1]).unwrap()])
    }
}

#[test]
fn debug_forward_traps_nan() {
    let _lock = debug_guard();
    let original = set_debug(true);

    let x = Variable::new(Array::scalar(1.0));
    let err = apply(EmitNan, &[x.clone()]).unwrap_err();
    assert!(matches!(
        err,
        AutogradError::DebugValidation {
            phase: Phase::Forward,
            index: 0,
            ..
        }
    ));

    // Finite (integer) outputs pass.
    assert!(apply(EmitInt, &[x]).is_ok());

    set_debug(original);
}

#[test]
fn nan_passes_when_debug_disabled() {
    let _lock = debug_guard();
    let original = set_debug(false);
    assert!(!is_debug());

    let x = Variable::new(Array::scalar(1.0));
    assert!(apply(EmitNan, &[x]).is_ok());

    set_debug(original);
}

struct NanGrad;

impl FunctionOp for NanGrad {
    fn label(&self) -> &str {
        "NanGrad"
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(inputs.to_vec())
    }

    fn backward(
        &self,
        _ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        _grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        let mut gxs = vec![None; target_indices.len()];
        gxs[0] = Some(Variable::new(Array::from_f32(&[f32::NAN], &[1]).unwrap()));
        Ok(gxs)
    }
}

struct NoneGrad;

impl FunctionOp for NoneGrad {
    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(inputs.to_vec())
    }
    // Default backward: all None.
}

#[test]
fn debug_backward_traps_nan_gradient() {
    let _lock = debug_guard();
    let original = set_debug(true);

    let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());
    let ys = apply(NanGrad, &[x]).unwrap();
    let err = ys[0].backward().unwrap_err();
    assert!(matches!(
        err,
        AutogradError::DebugValidation {
            phase: Phase::Backward,
            ..
        }
    ));

    set_debug(original);
}

#[test]
fn debug_backward_skips_none_gradients() {
    let _lock = debug_guard();
    let original = set_debug(true);

    let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());
    let ys = apply(NoneGrad, &[x.clone()]).unwrap();
    // Declining to produce a gradient is never a numerical error.
    ys[0].backward().unwrap();
    assert!(x.grad().is_none());

    set_debug(original);
}

// =============================================================================
// Recording scopes
// =============================================================================

#[test]
fn no_backprop_mode_suppresses_recording() {
    let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());

    let y = add_scalar(&x, 1.0).unwrap();
    assert!(y.creator().is_some());

    let y = {
        let _guard = no_backprop_mode();
        add_scalar(&x, 1.0).unwrap()
    };
    assert!(y.creator().is_none());
    assert!(!y.requires_grad());

    let y = add_scalar(&x, 1.0).unwrap();
    assert!(y.creator().is_some());
}

#[test]
fn force_backprop_mode_overrides_enclosing_scope() {
    let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());

    let (inner, outer) = {
        let _no = no_backprop_mode();
        let inner = {
            let _force = ember_autograd::force_backprop_mode();
            add_scalar(&x, 1.0).unwrap()
        };
        let outer = add_scalar(&x, 1.0).unwrap();
        (inner, outer)
    };
    assert!(inner.creator().is_some());
    assert!(outer.creator().is_none());

    let after = add_scalar(&x, 1.0).unwrap();
    assert!(after.creator().is_some());
}

#[test]
fn backprop_scopes_are_thread_local() {
    let _guard = no_backprop_mode();

    // A fresh thread has its own (default-enabled) stack.
    let recorded = std::thread::spawn(|| {
        let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());
        let y = add_scalar(&x, 1.0).unwrap();
        y.creator().is_some()
    })
    .join()
    .expect("thread should not panic");
    assert!(recorded);

    // And a thread entering no-backprop does not affect this one.
    let suppressed = std::thread::spawn(|| {
        let _guard = no_backprop_mode();
        let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());
        let y = add_scalar(&x, 1.0).unwrap();
        y.creator().is_none()
    })
    .join()
    .expect("thread should not panic");
    assert!(suppressed);

    let x = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());
    let y = add_scalar(&x, 1.0).unwrap();
    assert!(y.creator().is_none()); // still inside this thread's guard
}

// =============================================================================
// Retention
// =============================================================================

type Stash = Arc<Mutex<Vec<Variable>>>;

/// Passes inputs through, retaining position 1 on both sides, and records
/// what backward could see.
struct RetainingOp {
    seen_inputs: Stash,
    seen_outputs: Stash,
}

impl FunctionOp for RetainingOp {
    fn label(&self) -> &str {
        "RetainingOp"
    }

    fn forward_host(&self, ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        ctx.retain_inputs(&[1]);
        ctx.retain_outputs(&[1]);
        Ok(inputs.to_vec())
    }

    fn backward(
        &self,
        ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        *self.seen_inputs.lock().unwrap() = ctx.retained_inputs()?;
        *self.seen_outputs.lock().unwrap() = ctx.retained_outputs()?;
        let gy = grad_outputs.first().cloned().flatten();
        Ok(target_indices.iter().map(|_| gy.clone()).collect())
    }
}

#[test]
fn retention_exposes_exactly_the_declared_positions() {
    let seen_inputs: Stash = Arc::default();
    let seen_outputs: Stash = Arc::default();
    let op = RetainingOp {
        seen_inputs: Arc::clone(&seen_inputs),
        seen_outputs: Arc::clone(&seen_outputs),
    };

    let x0 = Variable::with_grad(Array::from_f32(&[1.0], &[1]).unwrap());
    let x1 = Variable::with_grad(Array::from_f32(&[2.0], &[1]).unwrap());
    let x1_data = x1.data().unwrap();

    let mut ys = apply(op, &[x0, x1.clone()]).unwrap();
    let y1_data = ys[1].data().unwrap();
    let func = ys[0].creator().unwrap();

    // Drop the second output before backward: retention must still work.
    ys.truncate(1);

    ys[0].set_grad(Array::from_f32(&[1.0], &[1]).unwrap());
    ys[0].backward().unwrap();

    let seen_inputs = seen_inputs.lock().unwrap();
    assert_eq!(seen_inputs.len(), 1);
    assert!(seen_inputs[0].ptr_eq(&x1)); // the original node, not a copy
    assert_eq!(seen_inputs[0].data().unwrap(), x1_data);

    let seen_outputs = seen_outputs.lock().unwrap();
    assert_eq!(seen_outputs.len(), 1);
    assert_eq!(seen_outputs[0].data().unwrap(), y1_data);

    // Undeclared positions are a contract violation, not a silent None.
    assert!(matches!(
        func.retained_input(0).unwrap_err(),
        AutogradError::RetentionViolation {
            kind: RetentionKind::Input,
            index: 0,
            ..
        }
    ));
    assert!(matches!(
        func.retained_output(0).unwrap_err(),
        AutogradError::RetentionViolation {
            kind: RetentionKind::Output,
            index: 0,
            ..
        }
    ));
}

// =============================================================================
// Raw-array inputs
// =============================================================================

#[test]
fn raw_arrays_are_wrapped_as_non_grad_leaves() {
    let x1: Variable = Array::arange(3).into();
    let x2: Variable = Array::from_i32(&[1, 2, 3], &[3]).unwrap().into();
    let ys = apply(HostOnly, &[x1, x2]).unwrap();
    for y in &ys {
        assert!(!y.requires_grad());
        assert!(y.creator().is_none());
    }
}
