//! Graph nodes.
//!
//! A `VariableNode` is the persistent identity of one value in the
//! computation graph: what it holds, which function produced it, and its
//! topological rank. Nodes are strongly owned by the `Variable`s that
//! reference them and by their consumers' input lists; a producer only
//! holds weak references to its outputs, so dropping every user-visible
//! `Variable` lets the graph behind it be reclaimed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use ember_core::Array;

use crate::function::FunctionNode;
use crate::variable::Variable;
use crate::Result;

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// One vertex of the computation graph.
///
/// Identity is the `Arc` allocation (compare with `Arc::ptr_eq` or via
/// `id()`); equality is never structural.
pub struct VariableNode {
    id: usize,
    rank: usize,
    requires_grad: AtomicBool,
    retain_grad: AtomicBool,
    data: RwLock<Option<Array>>,
    creator: RwLock<Option<Arc<FunctionNode>>>,
    grad: RwLock<Option<Variable>>,
}

impl VariableNode {
    /// Create a leaf node (rank 0, no creator).
    pub(crate) fn leaf(data: Array, requires_grad: bool) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            rank: 0,
            requires_grad: AtomicBool::new(requires_grad),
            retain_grad: AtomicBool::new(false),
            data: RwLock::new(Some(data)),
            creator: RwLock::new(None),
            grad: RwLock::new(None),
        })
    }

    /// Create a node produced by `creator` at the given rank.
    pub(crate) fn produced(data: Array, rank: usize, creator: Arc<FunctionNode>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            rank,
            requires_grad: AtomicBool::new(true),
            retain_grad: AtomicBool::new(false),
            data: RwLock::new(Some(data)),
            creator: RwLock::new(Some(creator)),
            grad: RwLock::new(None),
        })
    }

    /// Unique node id, usable as a hash/ordering key.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Topological rank: 0 for leaves, `1 + max(input ranks)` otherwise.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Whether gradients flow into this node during backward.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad.load(Ordering::Relaxed)
    }

    pub(crate) fn set_requires_grad(&self, value: bool) {
        self.requires_grad.store(value, Ordering::Relaxed);
    }

    /// Whether the final gradient should be kept on this node even if it
    /// is an intermediate.
    pub fn retains_grad(&self) -> bool {
        self.retain_grad.load(Ordering::Relaxed)
    }

    pub(crate) fn set_retain_grad(&self) {
        self.retain_grad.store(true, Ordering::Relaxed);
    }

    /// The function that produced this node, if any.
    pub fn creator(&self) -> Option<Arc<FunctionNode>> {
        self.creator.read().clone()
    }

    /// Sever the producer edge. Called by `FunctionNode::unchain`.
    pub(crate) fn clear_creator(&self) {
        *self.creator.write() = None;
    }

    /// The held value, if not pruned.
    pub fn data(&self) -> Option<Array> {
        self.data.read().clone()
    }

    /// The accumulated gradient, if any.
    pub fn grad(&self) -> Option<Variable> {
        self.grad.read().clone()
    }

    pub(crate) fn set_grad(&self, grad: Option<Variable>) {
        *self.grad.write() = grad;
    }

    /// Elementwise-accumulate a finished gradient into `.grad`.
    pub(crate) fn accumulate_grad(&self, grad: &Variable) -> Result<()> {
        let merged = match self.grad() {
            Some(existing) => {
                let a = existing.data().ok_or(crate::AutogradError::MissingData)?;
                let b = grad.data().ok_or(crate::AutogradError::MissingData)?;
                Variable::new(a.add(&b)?)
            }
            None => grad.clone(),
        };
        self.set_grad(Some(merged));
        Ok(())
    }
}

impl std::fmt::Debug for VariableNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableNode")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("requires_grad", &self.requires_grad())
            .field("has_creator", &self.creator.read().is_some())
            .finish()
    }
}
