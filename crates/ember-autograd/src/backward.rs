//! Backward scheduling.
//!
//! The scheduler walks function nodes in strictly decreasing rank order.
//! A node's accumulated gradient is final once every consumer (all of
//! which sit at a higher rank) has fired, so the producer popped from the
//! top of the heap always sees finished output gradients. Ties carry no
//! dependency and may run in any order; the accumulation rule is
//! commutative and associative, so tie order never changes final values.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use ember_core::Array;

use crate::error::AutogradError;
use crate::function::FunctionNode;
use crate::node::VariableNode;
use crate::variable::Variable;
use crate::Result;

struct Candidate {
    rank: usize,
    seq: usize,
    func: Arc<FunctionNode>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on rank; seq only breaks ties deterministically.
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct CandidateHeap {
    heap: BinaryHeap<Candidate>,
    seen: HashSet<usize>,
    seq: usize,
}

impl CandidateHeap {
    /// Each function enters the heap at most once.
    fn push(&mut self, func: Arc<FunctionNode>) {
        if self.seen.insert(func.id()) {
            self.heap.push(Candidate {
                rank: func.rank(),
                seq: self.seq,
                func,
            });
            self.seq += 1;
        }
    }

    fn pop(&mut self) -> Option<Arc<FunctionNode>> {
        self.heap.pop().map(|c| c.func)
    }
}

/// Run a full backward pass seeded at `root`.
pub(crate) fn run(root: &Variable) -> Result<()> {
    // Seed: existing grad, or ones shaped like the data. The seed lives in
    // the running totals until finalized, so it lands on the node exactly
    // once whether the root is produced or a leaf.
    let seed = match root.grad() {
        Some(g) => {
            root.node().set_grad(None);
            g
        }
        None => {
            let data = root.data().ok_or(AutogradError::MissingData)?;
            Variable::new(Array::ones_like(&data))
        }
    };

    // Running totals, keyed by node id. An entry is removed (finalized)
    // when the node's producer fires, or at the end for leaves.
    let mut grads: HashMap<usize, (Arc<VariableNode>, Variable)> = HashMap::new();
    grads.insert(root.node().id(), (Arc::clone(root.node()), seed));

    let mut candidates = CandidateHeap::default();
    if let Some(creator) = root.creator() {
        candidates.push(creator);
    }

    while let Some(func) = candidates.pop() {
        tracing::trace!(label = func.label(), rank = func.rank(), "backward step");

        // Gather finished output gradients; dead weak refs contribute None.
        let gys: Vec<Option<Variable>> = func
            .outputs()
            .iter()
            .map(|weak| {
                weak.upgrade()
                    .and_then(|node| grads.get(&node.id()).map(|(_, g)| g.clone()))
            })
            .collect();

        let Some(input_nodes) = func.inputs() else {
            // Unchained while pending; nothing to propagate through.
            continue;
        };

        let target_indices: Vec<usize> = input_nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.requires_grad())
            .map(|(i, _)| i)
            .collect();

        if !target_indices.is_empty() {
            // A node occupying several input positions contributes once per
            // position. The running total is handed to the first position
            // only, so it is not folded in more than once.
            let mut seen_inputs: HashSet<usize> = HashSet::new();
            let current: Vec<Option<Variable>> = target_indices
                .iter()
                .map(|&i| {
                    let id = input_nodes[i].id();
                    if seen_inputs.insert(id) {
                        grads.get(&id).map(|(_, g)| g.clone())
                    } else {
                        None
                    }
                })
                .collect();

            let merged = func.backward_accumulate(&target_indices, &gys, &current)?;

            let mut written: HashSet<usize> = HashSet::new();
            for (&i, gx) in target_indices.iter().zip(merged.into_iter()) {
                let node = &input_nodes[i];
                let Some(gx) = gx else { continue };
                let total = if written.insert(node.id()) {
                    gx
                } else {
                    // Later position of a duplicated input: sum with what
                    // this step already wrote for the node.
                    match grads.remove(&node.id()) {
                        Some((_, prev)) => {
                            let a = prev.data().ok_or(AutogradError::MissingData)?;
                            let b = gx.data().ok_or(AutogradError::MissingData)?;
                            Variable::new(a.add(&b)?)
                        }
                        None => gx,
                    }
                };
                grads.insert(node.id(), (Arc::clone(node), total));
                if let Some(creator) = node.creator() {
                    candidates.push(creator);
                }
            }
        }

        // This function's output gradients are now consumed; drop them
        // unless the user asked to keep them (or the node is the root).
        for weak in func.outputs() {
            if let Some(node) = weak.upgrade() {
                if let Some((_, g)) = grads.remove(&node.id()) {
                    if node.retains_grad() || Arc::ptr_eq(&node, root.node()) {
                        node.set_grad(Some(g));
                    }
                }
            }
        }
    }

    // Whatever remains was never consumed by a producer: leaves, plus any
    // node detached mid-pass. Leaves accumulate into their grad.
    for (_, (node, g)) in grads {
        if node.creator().is_none() {
            node.accumulate_grad(&g)?;
        } else if node.retains_grad() {
            node.set_grad(Some(g));
        }
    }

    Ok(())
}
