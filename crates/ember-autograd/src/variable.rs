//! User-facing variable handles.

use std::sync::Arc;

use ember_core::Array;

use crate::backward;
use crate::function::FunctionNode;
use crate::node::VariableNode;
use crate::Result;

/// A handle to one graph node.
///
/// Cloning a `Variable` is cheap (it clones the `Arc`); both clones refer
/// to the same node, so identity-sensitive checks use
/// [`Variable::ptr_eq`].
///
/// A `Variable` built directly from an `Array` does not require grad;
/// use [`Variable::with_grad`] for trainable leaves. Variables produced by
/// [`crate::function::apply`] under an enabled recording scope require
/// grad automatically.
#[derive(Clone)]
pub struct Variable {
    node: Arc<VariableNode>,
}

impl Variable {
    /// Wrap a raw array as a non-grad-requiring leaf.
    pub fn new(data: Array) -> Self {
        Self {
            node: VariableNode::leaf(data, false),
        }
    }

    /// Wrap a raw array as a leaf that requires grad (e.g. a parameter).
    pub fn with_grad(data: Array) -> Self {
        Self {
            node: VariableNode::leaf(data, true),
        }
    }

    pub(crate) fn from_node(node: Arc<VariableNode>) -> Self {
        Self { node }
    }

    /// The underlying graph node.
    pub fn node(&self) -> &Arc<VariableNode> {
        &self.node
    }

    /// Whether two handles refer to the same graph node.
    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// The held value, if not pruned.
    pub fn data(&self) -> Option<Array> {
        self.node.data()
    }

    /// Topological rank of the node.
    pub fn rank(&self) -> usize {
        self.node.rank()
    }

    /// The function that produced this variable, or `None` for leaves and
    /// detached values.
    pub fn creator(&self) -> Option<Arc<FunctionNode>> {
        self.node.creator()
    }

    /// Whether gradients flow into this variable during backward.
    pub fn requires_grad(&self) -> bool {
        self.node.requires_grad()
    }

    /// Explicitly mark this leaf as requiring (or not requiring) grad.
    pub fn set_requires_grad(&self, value: bool) {
        self.node.set_requires_grad(value);
    }

    /// The accumulated gradient variable, if any.
    pub fn grad(&self) -> Option<Variable> {
        self.node.grad()
    }

    /// The accumulated gradient's array, if any.
    pub fn grad_array(&self) -> Option<Array> {
        self.node.grad().and_then(|g| g.data())
    }

    /// Seed or replace the gradient.
    pub fn set_grad(&self, grad: Array) {
        self.node.set_grad(Some(Variable::new(grad)));
    }

    /// Drop the accumulated gradient.
    pub fn cleargrad(&self) {
        self.node.set_grad(None);
    }

    /// Keep the final gradient on this variable even if it is an
    /// intermediate node (intermediate grads are otherwise dropped once
    /// consumed).
    pub fn retain_grad(&self) {
        self.node.set_retain_grad();
    }

    /// Run a full backward pass seeded at this variable.
    ///
    /// If no gradient has been set, it is seeded with ones of the same
    /// shape, dtype, and device as the data.
    pub fn backward(&self) -> Result<()> {
        backward::run(self)
    }
}

impl From<Array> for Variable {
    fn from(data: Array) -> Self {
        Variable::new(data)
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable").field("node", &self.node).finish()
    }
}
