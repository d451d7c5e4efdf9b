//! Dominator and post-dominator trees.
//!
//! Both trees are computed with the iterative algorithm of Cooper, Harvey
//! and Kennedy over a reverse postorder. The post-dominator tree runs the
//! same algorithm on the reversed CFG rooted at a virtual exit node that
//! precedes every returning block.

use super::cfg::ControlFlowGraph;
use crate::ir::{BlockId, Function};

/// Immediate-dominator table over dense node indices.
#[derive(Debug, Clone)]
struct IdomTable {
    idom: Vec<Option<usize>>,
    root: usize,
}

impl IdomTable {
    fn compute(succs: &[Vec<usize>], preds: &[Vec<usize>], root: usize) -> Self {
        let n = succs.len();
        let order = postorder(succs, root);
        let mut po_num = vec![usize::MAX; n];
        for (i, &b) in order.iter().enumerate() {
            po_num[b] = i;
        }

        let mut idom: Vec<Option<usize>> = vec![None; n];
        idom[root] = Some(root);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in order.iter().rev() {
                if b == root {
                    continue;
                }
                let mut new_idom: Option<usize> = None;
                for &p in &preds[b] {
                    if idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &po_num, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        Self { idom, root }
    }

    fn dominates(&self, a: usize, b: usize) -> bool {
        if self.idom.get(b).copied().flatten().is_none() || self.idom.get(a).copied().flatten().is_none() {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            if cur == self.root {
                return false;
            }
            match self.idom[cur] {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    fn idom(&self, b: usize) -> Option<usize> {
        match self.idom.get(b).copied().flatten() {
            Some(d) if b != self.root => Some(d),
            _ => None,
        }
    }
}

fn intersect(idom: &[Option<usize>], po_num: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while po_num[a] < po_num[b] {
            a = match idom[a] {
                Some(next) => next,
                None => return b,
            };
        }
        while po_num[b] < po_num[a] {
            b = match idom[b] {
                Some(next) => next,
                None => return a,
            };
        }
    }
    a
}

fn postorder(succs: &[Vec<usize>], root: usize) -> Vec<usize> {
    let mut visited = vec![false; succs.len()];
    let mut order = Vec::new();
    let mut stack = vec![(root, 0usize)];
    visited[root] = true;

    while let Some((node, next)) = stack.pop() {
        if let Some(&succ) = succs[node].get(next) {
            stack.push((node, next + 1));
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            order.push(node);
        }
    }
    order
}

/// Forward dominator tree rooted at the entry block.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    table: Option<IdomTable>,
}

impl DominatorTree {
    pub fn compute(func: &Function) -> Self {
        Self::from_cfg(&ControlFlowGraph::compute(func))
    }

    pub fn from_cfg(cfg: &ControlFlowGraph) -> Self {
        let Some(entry) = cfg.entry() else {
            return Self { table: None };
        };
        let n = cfg.capacity();
        let succs: Vec<Vec<usize>> = (0..n)
            .map(|i| cfg.succs(BlockId(i as u32)).iter().map(|b| b.index()).collect())
            .collect();
        let preds: Vec<Vec<usize>> = (0..n)
            .map(|i| cfg.preds(BlockId(i as u32)).iter().map(|b| b.index()).collect())
            .collect();
        Self { table: Some(IdomTable::compute(&succs, &preds, entry.index())) }
    }

    /// Whether every path from the entry to `b` passes through `a`.
    /// Unreachable blocks dominate nothing and are dominated by nothing.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.table.as_ref().map_or(false, |t| t.dominates(a.index(), b.index()))
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.table.as_ref()?.idom(b.index()).map(|i| BlockId(i as u32))
    }
}

/// Post-dominator tree rooted at a virtual exit joining every return.
#[derive(Debug, Clone)]
pub struct PostDominatorTree {
    table: IdomTable,
}

impl PostDominatorTree {
    pub fn compute(func: &Function) -> Self {
        Self::from_cfg(&ControlFlowGraph::compute(func))
    }

    pub fn from_cfg(cfg: &ControlFlowGraph) -> Self {
        let n = cfg.capacity();
        let virtual_exit = n;
        let mut succs: Vec<Vec<usize>> = (0..n)
            .map(|i| cfg.preds(BlockId(i as u32)).iter().map(|b| b.index()).collect())
            .collect();
        let mut preds: Vec<Vec<usize>> = (0..n)
            .map(|i| cfg.succs(BlockId(i as u32)).iter().map(|b| b.index()).collect())
            .collect();

        let returns: Vec<usize> = cfg.return_blocks().iter().map(|b| b.index()).collect();
        for &r in &returns {
            preds[r].push(virtual_exit);
        }
        succs.push(returns);
        preds.push(Vec::new());

        Self { table: IdomTable::compute(&succs, &preds, virtual_exit) }
    }

    /// Whether every path from `b` to a function exit passes through `a`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.table.dominates(a.index(), b.index())
    }

    /// Immediate post-dominator; `None` when it is the virtual exit.
    pub fn ipdom(&self, b: BlockId) -> Option<BlockId> {
        self.table
            .idom(b.index())
            .filter(|&i| i != self.table.root)
            .map(|i| BlockId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpPred, FunctionBuilder, Type, Value};

    #[test]
    fn test_loop_dominance() {
        let mut b = FunctionBuilder::new("f");
        let lp = b.counted_loop("i", Value::Const(0), Value::Const(4), 1, |_, _| {});
        b.ret(None);
        let f = b.finish();
        let dt = DominatorTree::compute(&f);
        let pdt = PostDominatorTree::compute(&f);

        assert!(dt.dominates(lp.header, lp.body));
        assert!(dt.dominates(lp.header, lp.latch));
        assert!(dt.dominates(lp.header, lp.header));
        assert!(!dt.dominates(lp.body, lp.exit));
        assert_eq!(dt.idom(lp.exit), Some(lp.header));

        assert!(pdt.dominates(lp.header, lp.body));
        assert!(pdt.dominates(lp.exit, lp.preheader));
        assert!(!pdt.dominates(lp.body, lp.header));
        assert_eq!(pdt.ipdom(lp.latch), Some(lp.header));
        assert_eq!(pdt.ipdom(lp.exit), None);
    }

    #[test]
    fn test_diamond_postdominance() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param("x", Type::Int);
        let then_bb = b.create_block("then");
        let join = b.create_block("join");
        let entry = b.current_block();
        let c = b.cmp(CmpPred::Sgt, x, Value::Const(0));
        b.cond_br(c, then_bb, join);
        b.switch_to(then_bb);
        b.br(join);
        b.switch_to(join);
        b.ret(None);
        let f = b.finish();

        let dt = DominatorTree::compute(&f);
        let pdt = PostDominatorTree::compute(&f);
        assert!(dt.dominates(entry, then_bb));
        assert!(!dt.dominates(then_bb, join));
        assert!(pdt.dominates(join, entry));
        assert!(!pdt.dominates(then_bb, entry));
    }
}
