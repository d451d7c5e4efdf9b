//! Control-flow graph queries derived from a function's terminators.

use crate::ir::{BlockId, Function, InstKind};

/// Successor/predecessor lists and traversal orders for the live blocks of a
/// function. Tables are indexed by `BlockId::index()`.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    entry: Option<BlockId>,
    succs: Vec<Vec<BlockId>>,
    preds: Vec<Vec<BlockId>>,
    rpo: Vec<BlockId>,
    rpo_index: Vec<Option<usize>>,
    returns: Vec<BlockId>,
}

impl ControlFlowGraph {
    pub fn compute(func: &Function) -> Self {
        let cap = func.block_capacity();
        let mut succs = vec![Vec::new(); cap];
        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); cap];
        let mut returns = Vec::new();

        for &block in func.layout() {
            let mut out = func.successors(block);
            out.dedup();
            for &s in &out {
                if !preds[s.index()].contains(&block) {
                    preds[s.index()].push(block);
                }
            }
            succs[block.index()] = out;
            if let Some(term) = func.terminator(block) {
                if matches!(func.inst(term).kind, InstKind::Ret { .. }) {
                    returns.push(block);
                }
            }
        }

        let entry = func.entry();
        let mut rpo = match entry {
            Some(e) => postorder(&succs, e),
            None => Vec::new(),
        };
        rpo.reverse();
        let mut rpo_index = vec![None; cap];
        for (i, b) in rpo.iter().enumerate() {
            rpo_index[b.index()] = Some(i);
        }

        Self { entry, succs, preds, rpo, rpo_index, returns }
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn succs(&self, block: BlockId) -> &[BlockId] {
        &self.succs[block.index()]
    }

    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        &self.preds[block.index()]
    }

    /// Blocks reachable from the entry, in reverse postorder.
    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    pub fn rpo_index(&self, block: BlockId) -> Option<usize> {
        self.rpo_index.get(block.index()).copied().flatten()
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_index(block).is_some()
    }

    /// Reachable blocks ending in a return.
    pub fn return_blocks(&self) -> Vec<BlockId> {
        self.returns.iter().copied().filter(|b| self.is_reachable(*b)).collect()
    }

    pub fn capacity(&self) -> usize {
        self.succs.len()
    }
}

/// Iterative depth-first postorder from `root`.
fn postorder(succs: &[Vec<BlockId>], root: BlockId) -> Vec<BlockId> {
    let mut visited = vec![false; succs.len()];
    let mut order = Vec::new();
    let mut stack = vec![(root, 0usize)];
    visited[root.index()] = true;

    while let Some((block, next)) = stack.pop() {
        if let Some(&succ) = succs[block.index()].get(next) {
            stack.push((block, next + 1));
            if !visited[succ.index()] {
                visited[succ.index()] = true;
                stack.push((succ, 0));
            }
        } else {
            order.push(block);
        }
    }

    order
}
