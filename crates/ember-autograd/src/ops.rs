//! Built-in differentiable operations.
//!
//! A deliberately small set: enough for realistic graphs in this
//! workspace's own tests and for downstream crates to crib the
//! `FunctionOp` implementation pattern from. Larger operation libraries
//! live outside the engine.

use ember_core::Array;

use crate::error::AutogradError;
use crate::function::{apply, BackwardContext, ForwardContext, FunctionOp};
use crate::type_check::{InTypes, TypeCheckResult};
use crate::variable::Variable;
use crate::Result;

/// Identity: outputs are the inputs, gradients pass through unchanged.
pub struct Identity;

impl FunctionOp for Identity {
    fn label(&self) -> &str {
        "Identity"
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(inputs.to_vec())
    }

    fn forward_accel(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(inputs.to_vec())
    }

    fn backward(
        &self,
        _ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        Ok(target_indices
            .iter()
            .map(|&i| grad_outputs.get(i).cloned().flatten())
            .collect())
    }
}

/// Elementwise addition of two variables.
pub struct Add;

impl FunctionOp for Add {
    fn label(&self) -> &str {
        "Add"
    }

    fn check_type_forward(&self, in_types: &InTypes) -> TypeCheckResult {
        in_types.expect_arity(2)?;
        in_types.expect_same_dtype(0, 1)?;
        in_types.expect_same_shape(0, 1)
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(vec![inputs[0].add(&inputs[1])?])
    }

    fn forward_accel(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(vec![inputs[0].add(&inputs[1])?])
    }

    fn backward(
        &self,
        _ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        let gy = grad_outputs.first().cloned().flatten();
        Ok(target_indices.iter().map(|_| gy.clone()).collect())
    }
}

/// Elementwise multiplication of two variables.
///
/// Retains both inputs during forward: backward needs their values.
pub struct Mul;

impl FunctionOp for Mul {
    fn label(&self) -> &str {
        "Mul"
    }

    fn check_type_forward(&self, in_types: &InTypes) -> TypeCheckResult {
        in_types.expect_arity(2)?;
        in_types[0].expect_float()?;
        in_types.expect_same_dtype(0, 1)?;
        in_types.expect_same_shape(0, 1)
    }

    fn forward_host(&self, ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        ctx.retain_inputs(&[0, 1]);
        Ok(vec![inputs[0].mul(&inputs[1])?])
    }

    fn forward_accel(&self, ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        ctx.retain_inputs(&[0, 1]);
        Ok(vec![inputs[0].mul(&inputs[1])?])
    }

    fn backward(
        &self,
        ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        let Some(gy) = grad_outputs.first().cloned().flatten() else {
            return Ok(vec![None; target_indices.len()]);
        };
        let gy_data = gy.data().ok_or(AutogradError::MissingData)?;
        target_indices
            .iter()
            .map(|&i| {
                // d(x0*x1)/dx0 = x1 and vice versa.
                let other = ctx.retained_input(1 - i)?;
                let other_data = other.data().ok_or(AutogradError::MissingData)?;
                Ok(Some(Variable::new(gy_data.mul(&other_data)?)))
            })
            .collect()
    }
}

/// Add a scalar constant to a variable.
pub struct AddScalar(pub f64);

impl FunctionOp for AddScalar {
    fn label(&self) -> &str {
        "AddScalar"
    }

    fn check_type_forward(&self, in_types: &InTypes) -> TypeCheckResult {
        in_types.expect_arity(1)?;
        in_types[0].expect_float()
    }

    fn forward_host(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(vec![inputs[0].add_scalar(self.0)?])
    }

    fn forward_accel(&self, _ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>> {
        Ok(vec![inputs[0].add_scalar(self.0)?])
    }

    fn backward(
        &self,
        _ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        let gy = grad_outputs.first().cloned().flatten();
        Ok(target_indices.iter().map(|_| gy.clone()).collect())
    }
}

fn single(mut ys: Vec<Variable>, label: &str) -> Result<Variable> {
    if ys.len() == 1 {
        Ok(ys.swap_remove(0))
    } else {
        Err(AutogradError::ArityMismatch {
            label: label.to_string(),
            expected: 1,
            actual: ys.len(),
        })
    }
}

/// `a + b`, recorded into the graph.
pub fn add(a: &Variable, b: &Variable) -> Result<Variable> {
    single(apply(Add, &[a.clone(), b.clone()])?, "Add")
}

/// `a * b`, recorded into the graph.
pub fn mul(a: &Variable, b: &Variable) -> Result<Variable> {
    single(apply(Mul, &[a.clone(), b.clone()])?, "Mul")
}

/// `a + c`, recorded into the graph.
pub fn add_scalar(a: &Variable, c: f64) -> Result<Variable> {
    single(apply(AddScalar(c), &[a.clone()])?, "AddScalar")
}

/// Identity of `a`, recorded into the graph.
pub fn identity(a: &Variable) -> Result<Variable> {
    single(apply(Identity, &[a.clone()])?, "Identity")
}
