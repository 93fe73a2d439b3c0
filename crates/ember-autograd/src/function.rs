//! Function nodes: the unit of recorded computation.
//!
//! Operation authors implement [`FunctionOp`] (type check, one forward per
//! device, backward). [`apply`] runs the pipeline: type check, device
//! dispatch, debug validation, then — if recording is enabled and some
//! input requires grad — links a [`FunctionNode`] into the graph with
//! strong references to its inputs and weak references to its outputs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use ember_core::{Array, Device};

use crate::debug;
use crate::error::{AutogradError, Phase, RetentionKind};
use crate::node::VariableNode;
use crate::scope;
use crate::type_check::{InTypes, TypeCheckResult};
use crate::variable::Variable;
use crate::Result;

static NEXT_FUNCTION_ID: AtomicUsize = AtomicUsize::new(0);

/// A differentiable operation.
///
/// `forward_host`/`forward_accel` receive the raw input arrays and return
/// the output arrays (a single-output operation returns a one-element
/// vector). They may call [`ForwardContext::retain_inputs`] /
/// [`ForwardContext::retain_outputs`] to opt specific positions into
/// surviving until backward; everything else is eligible for release once
/// forward completes.
///
/// `backward` receives the subset of input indices gradients are wanted
/// for, plus one gradient per output (`None` where the output is no longer
/// alive). It returns one gradient per requested index, `None` meaning "no
/// contribution".
pub trait FunctionOp: Send + Sync {
    /// Display label used in error messages.
    fn label(&self) -> &str {
        "FunctionNode"
    }

    /// Validate input descriptors. Runs exactly once per `apply`, before
    /// any forward computation touches the data.
    fn check_type_forward(&self, _in_types: &InTypes) -> TypeCheckResult {
        Ok(())
    }

    /// Forward implementation for host-device inputs.
    fn forward_host(&self, ctx: &mut ForwardContext, inputs: &[Array]) -> Result<Vec<Array>>;

    /// Forward implementation for accelerated-device inputs.
    fn forward_accel(&self, _ctx: &mut ForwardContext, _inputs: &[Array]) -> Result<Vec<Array>> {
        Err(AutogradError::NoKernel {
            label: self.label().to_string(),
            device: Device::Accel,
        })
    }

    /// Gradients with respect to the inputs at `target_indices`.
    fn backward(
        &self,
        _ctx: &BackwardContext<'_>,
        target_indices: &[usize],
        _grad_outputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        Ok(vec![None; target_indices.len()])
    }
}

/// Handed to forward implementations to declare retention.
#[derive(Debug, Default)]
pub struct ForwardContext {
    retained_inputs: Vec<usize>,
    retained_outputs: Vec<usize>,
}

impl ForwardContext {
    /// Keep the input values at `indices` alive for use in backward.
    pub fn retain_inputs(&mut self, indices: &[usize]) {
        self.retained_inputs.extend_from_slice(indices);
        self.retained_inputs.sort_unstable();
        self.retained_inputs.dedup();
    }

    /// Keep the output values at `indices` alive for use in backward.
    pub fn retain_outputs(&mut self, indices: &[usize]) {
        self.retained_outputs.extend_from_slice(indices);
        self.retained_outputs.sort_unstable();
        self.retained_outputs.dedup();
    }
}

/// Handed to backward implementations to access retained values.
pub struct BackwardContext<'a> {
    node: &'a FunctionNode,
}

impl BackwardContext<'_> {
    /// All retained inputs, in declaration order.
    pub fn retained_inputs(&self) -> Result<Vec<Variable>> {
        self.node.get_retained_inputs()
    }

    /// All retained outputs, in declaration order.
    pub fn retained_outputs(&self) -> Result<Vec<Variable>> {
        self.node.get_retained_outputs()
    }

    /// The retained input at `index`. Requesting a position that was not
    /// declared via `retain_inputs` is a contract violation.
    pub fn retained_input(&self, index: usize) -> Result<Variable> {
        self.node.retained_input(index)
    }

    /// The retained output at `index`. Requesting a position that was not
    /// declared via `retain_outputs` is a contract violation.
    pub fn retained_output(&self, index: usize) -> Result<Variable> {
        self.node.retained_output(index)
    }
}

/// A recorded operation: the graph edge between its input and output nodes.
///
/// Inputs are held strongly (they must survive until backward); outputs
/// are held weakly so the function does not keep its own results alive
/// once the user drops every `Variable` pointing at them.
pub struct FunctionNode {
    id: usize,
    op: Box<dyn FunctionOp>,
    rank: usize,
    inputs: RwLock<Option<Vec<Arc<VariableNode>>>>,
    outputs: RwLock<Vec<Weak<VariableNode>>>,
    retained_inputs: Vec<usize>,
    retained_outputs: Vec<usize>,
    /// Strong copies of retained output values, so retention survives the
    /// output `Variable` being dropped.
    retained_output_data: RwLock<Vec<(usize, Array)>>,
}

impl FunctionNode {
    /// Unique function id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Display label of the wrapped operation.
    pub fn label(&self) -> &str {
        self.op.label()
    }

    /// Rank assigned at apply: `1 + max(input ranks)`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Strong references to the input nodes, or `None` after `unchain`.
    pub fn inputs(&self) -> Option<Vec<Arc<VariableNode>>> {
        self.inputs.read().clone()
    }

    /// Weak references to the output nodes, in production order.
    pub fn outputs(&self) -> Vec<Weak<VariableNode>> {
        self.outputs.read().clone()
    }

    /// Sever this function's backward edges.
    ///
    /// Live outputs lose their creator; the strong input references are
    /// dropped so the ancestry can be reclaimed immediately instead of
    /// waiting for the last consumer to go away.
    pub fn unchain(&self) {
        for weak in self.outputs.read().iter() {
            if let Some(node) = weak.upgrade() {
                node.clear_creator();
            }
        }
        *self.inputs.write() = None;
        self.retained_output_data.write().clear();
    }

    /// Retained inputs in declaration order.
    pub fn get_retained_inputs(&self) -> Result<Vec<Variable>> {
        self.retained_inputs
            .iter()
            .map(|&i| self.retained_input(i))
            .collect()
    }

    /// Retained outputs in declaration order.
    pub fn get_retained_outputs(&self) -> Result<Vec<Variable>> {
        self.retained_outputs
            .iter()
            .map(|&i| self.retained_output(i))
            .collect()
    }

    /// The retained input at `index`.
    pub fn retained_input(&self, index: usize) -> Result<Variable> {
        if !self.retained_inputs.contains(&index) {
            return Err(AutogradError::RetentionViolation {
                label: self.label().to_string(),
                kind: RetentionKind::Input,
                index,
            });
        }
        let inputs = self.inputs.read();
        let nodes = inputs.as_ref().ok_or(AutogradError::MissingData)?;
        let node = nodes.get(index).ok_or(AutogradError::MissingData)?;
        Ok(Variable::from_node(Arc::clone(node)))
    }

    /// The retained output at `index`.
    pub fn retained_output(&self, index: usize) -> Result<Variable> {
        if !self.retained_outputs.contains(&index) {
            return Err(AutogradError::RetentionViolation {
                label: self.label().to_string(),
                kind: RetentionKind::Output,
                index,
            });
        }
        // Prefer the live node so identity is preserved.
        if let Some(node) = self
            .outputs
            .read()
            .get(index)
            .and_then(|weak| weak.upgrade())
        {
            return Ok(Variable::from_node(node));
        }
        // The Variable was dropped; rebuild from the stashed value.
        self.retained_output_data
            .read()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, data)| Variable::new(data.clone()))
            .ok_or(AutogradError::MissingData)
    }

    /// Run the operation's backward and merge the result into the running
    /// per-input totals.
    ///
    /// For each requested index: absent/absent stays absent, one-sided
    /// results pass through unchanged (same allocation, no copy), and
    /// two-sided results are summed into a fresh variable. The merge is
    /// commutative and associative, so accumulation order across multiple
    /// producers never changes the final gradient.
    pub fn backward_accumulate(
        &self,
        target_indices: &[usize],
        grad_outputs: &[Option<Variable>],
        grad_inputs: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>> {
        debug_assert_eq!(target_indices.len(), grad_inputs.len());

        let ctx = BackwardContext { node: self };
        let gxs = self.op.backward(&ctx, target_indices, grad_outputs)?;
        if gxs.len() != target_indices.len() {
            return Err(AutogradError::ArityMismatch {
                label: self.label().to_string(),
                expected: target_indices.len(),
                actual: gxs.len(),
            });
        }

        if debug::is_debug() {
            // None entries are skipped: declining to produce a gradient is
            // a structural statement, not a numerical result.
            for (i, gx) in gxs.iter().enumerate() {
                if let Some(data) = gx.as_ref().and_then(|g| g.data()) {
                    if data.has_non_finite() {
                        return Err(AutogradError::DebugValidation {
                            label: self.label().to_string(),
                            phase: Phase::Backward,
                            index: i,
                        });
                    }
                }
            }
        }

        gxs.into_iter()
            .zip(grad_inputs.iter())
            .map(|(gx, acc)| match (gx, acc) {
                (None, None) => Ok(None),
                (Some(g), None) => Ok(Some(g)),
                (None, Some(a)) => Ok(Some(a.clone())),
                (Some(g), Some(a)) => {
                    let lhs = g.data().ok_or(AutogradError::MissingData)?;
                    let rhs = a.data().ok_or(AutogradError::MissingData)?;
                    Ok(Some(Variable::new(lhs.add(&rhs)?)))
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionNode")
            .field("id", &self.id)
            .field("label", &self.label())
            .field("rank", &self.rank)
            .finish()
    }
}

/// Run an operation on the given inputs, recording it into the graph when
/// appropriate.
///
/// Raw arrays can be passed by converting with `Variable::from` (they are
/// treated as non-grad-requiring leaves). Either the operation fully
/// registers (on success) or the graph is left exactly as it was.
pub fn apply<O: FunctionOp + 'static>(op: O, inputs: &[Variable]) -> Result<Vec<Variable>> {
    let in_arrays: Vec<Array> = inputs
        .iter()
        .map(|v| v.data().ok_or(AutogradError::MissingData))
        .collect::<Result<_>>()?;

    // Type check runs exactly once, before dispatch.
    let in_types = InTypes::from_arrays(&in_arrays);
    op.check_type_forward(&in_types)
        .map_err(|failure| AutogradError::InvalidType {
            label: op.label().to_string(),
            phase: Phase::Forward,
            expect: failure.expect,
            actual: failure.actual,
        })?;

    // Closed two-way dispatch on the inputs' device tag.
    let device = in_arrays.first().map(Array::device).unwrap_or_default();
    let mut fctx = ForwardContext::default();
    let out_arrays = match device {
        Device::Host => op.forward_host(&mut fctx, &in_arrays)?,
        Device::Accel => op.forward_accel(&mut fctx, &in_arrays)?,
    };

    if debug::is_debug() {
        for (i, out) in out_arrays.iter().enumerate() {
            if out.has_non_finite() {
                return Err(AutogradError::DebugValidation {
                    label: op.label().to_string(),
                    phase: Phase::Forward,
                    index: i,
                });
            }
        }
    }

    let recording = scope::backprop_enabled() && inputs.iter().any(Variable::requires_grad);
    if !recording {
        tracing::trace!(label = op.label(), "apply without recording");
        return Ok(out_arrays.into_iter().map(Variable::new).collect());
    }

    let rank = 1 + inputs.iter().map(Variable::rank).max().unwrap_or(0);
    let input_nodes: Vec<Arc<VariableNode>> =
        inputs.iter().map(|v| Arc::clone(v.node())).collect();

    let func = Arc::new(FunctionNode {
        id: NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed),
        op: Box::new(op),
        rank,
        inputs: RwLock::new(Some(input_nodes)),
        outputs: RwLock::new(Vec::new()),
        retained_inputs: fctx.retained_inputs,
        retained_outputs: fctx.retained_outputs,
        retained_output_data: RwLock::new(Vec::new()),
    });

    let mut stash = Vec::new();
    let out_vars: Vec<Variable> = out_arrays
        .into_iter()
        .enumerate()
        .map(|(i, data)| {
            if func.retained_outputs.contains(&i) {
                stash.push((i, data.clone()));
            }
            Variable::from_node(VariableNode::produced(data, rank, Arc::clone(&func)))
        })
        .collect();

    *func.outputs.write() = out_vars.iter().map(|v| Arc::downgrade(v.node())).collect();
    *func.retained_output_data.write() = stash;

    tracing::trace!(
        label = func.label(),
        rank,
        outputs = out_vars.len(),
        "recorded function node"
    );
    Ok(out_vars)
}
