//! Loop-nest discovery.
//!
//! Natural loops are found from back edges (`tail -> header` where the header
//! dominates the tail). Loops sharing a header are merged, nesting follows
//! block containment, and each loop records the structural pieces the fusion
//! pass reasons about: latch, preheader, optional guard, exits and the
//! induction variable.

use super::cfg::ControlFlowGraph;
use super::dominators::DominatorTree;
use crate::ir::{BinaryOp, BlockId, Function, InstId, InstKind, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Index of a loop inside its [`LoopInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub u32);

impl LoopId {
    pub fn index(self) -> usize { self.0 as usize }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A header phi advanced by a constant on every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InductionVariable {
    /// The header phi
    pub phi: InstId,
    /// Value flowing in from the preheader
    pub start: Value,
    /// Constant increment per iteration, never zero
    pub step: i64,
    /// The latch-side increment instruction
    pub next: InstId,
}

impl InductionVariable {
    pub fn value(&self) -> Value {
        Value::Inst(self.phi)
    }

    /// Starts at zero and steps by one.
    pub fn is_canonical(&self) -> bool {
        self.start == Value::Const(0) && self.step == 1
    }
}

/// Read-only model of one loop.
#[derive(Debug, Clone)]
pub struct Loop {
    id: LoopId,
    header: BlockId,
    latches: Vec<BlockId>,
    /// All blocks of the loop, header included, in layout order
    blocks: Vec<BlockId>,
    members: BTreeSet<BlockId>,
    parent: Option<LoopId>,
    children: Vec<LoopId>,
    depth: usize,
    preheader: Option<BlockId>,
    guard: Option<BlockId>,
    exits: Vec<BlockId>,
    non_latch_exits: Vec<BlockId>,
    exiting: Vec<BlockId>,
    iv: Option<InductionVariable>,
}

impl Loop {
    pub fn id(&self) -> LoopId { self.id }
    pub fn header(&self) -> BlockId { self.header }
    pub fn depth(&self) -> usize { self.depth }
    pub fn parent(&self) -> Option<LoopId> { self.parent }
    pub fn children(&self) -> &[LoopId] { &self.children }
    pub fn latches(&self) -> &[BlockId] { &self.latches }
    pub fn preheader(&self) -> Option<BlockId> { self.preheader }
    pub fn guard(&self) -> Option<BlockId> { self.guard }
    pub fn induction_variable(&self) -> Option<&InductionVariable> { self.iv.as_ref() }

    /// The unique back-edge source, if there is exactly one.
    pub fn latch(&self) -> Option<BlockId> {
        match self.latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    /// Block through which control first reaches the loop: the guard block
    /// for guarded loops, the preheader otherwise.
    pub fn entry_block(&self) -> Option<BlockId> {
        self.guard.or(self.preheader)
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.members.contains(&block)
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks other than the header and latches, in layout order.
    pub fn body_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .copied()
            .filter(|b| *b != self.header && !self.latches.contains(b))
            .collect()
    }

    /// Unique blocks outside the loop with a predecessor inside it.
    pub fn exit_blocks(&self) -> &[BlockId] {
        &self.exits
    }

    /// Unique exit blocks reached from an exiting block that is not a latch.
    pub fn non_latch_exit_blocks(&self) -> &[BlockId] {
        &self.non_latch_exits
    }

    /// Blocks inside the loop with a successor outside it.
    pub fn exiting_blocks(&self) -> &[BlockId] {
        &self.exiting
    }

    /// Unique latch, preheader and an induction variable.
    pub fn is_simplified(&self) -> bool {
        self.latch().is_some() && self.preheader.is_some() && self.iv.is_some()
    }
}

/// The loop forest of a function.
#[derive(Debug, Clone, Default)]
pub struct LoopInfo {
    loops: Vec<Loop>,
    top_level: Vec<LoopId>,
    innermost: Vec<Option<LoopId>>,
}

impl LoopInfo {
    pub fn compute(func: &Function, cfg: &ControlFlowGraph, dom: &DominatorTree) -> Self {
        let cap = func.block_capacity();
        let mut layout_pos = vec![usize::MAX; cap];
        for (pos, b) in func.layout().iter().enumerate() {
            layout_pos[b.index()] = pos;
        }

        // Headers in reverse postorder: an enclosing header always comes first.
        let mut loops: Vec<Loop> = Vec::new();
        for &header in cfg.reverse_postorder() {
            let latches: Vec<BlockId> = cfg
                .preds(header)
                .iter()
                .copied()
                .filter(|p| cfg.is_reachable(*p) && dom.dominates(header, *p))
                .collect();
            if latches.is_empty() {
                continue;
            }

            let mut members = BTreeSet::new();
            members.insert(header);
            let mut worklist: Vec<BlockId> = latches.clone();
            while let Some(b) = worklist.pop() {
                if !cfg.is_reachable(b) || !members.insert(b) {
                    continue;
                }
                worklist.extend(cfg.preds(b).iter().copied());
            }

            let mut blocks: Vec<BlockId> = members.iter().copied().collect();
            blocks.sort_by_key(|b| layout_pos[b.index()]);

            let id = LoopId(loops.len() as u32);
            loops.push(Loop {
                id,
                header,
                latches,
                blocks,
                members,
                parent: None,
                children: Vec::new(),
                depth: 1,
                preheader: None,
                guard: None,
                exits: Vec::new(),
                non_latch_exits: Vec::new(),
                exiting: Vec::new(),
                iv: None,
            });
        }

        // Nesting: the smallest other loop containing the header is the parent.
        for i in 0..loops.len() {
            let header = loops[i].header;
            let parent = loops
                .iter()
                .enumerate()
                .filter(|(j, l)| *j != i && l.contains(header))
                .min_by_key(|(_, l)| l.num_blocks())
                .map(|(j, _)| LoopId(j as u32));
            loops[i].parent = parent;
        }
        let mut top_level = Vec::new();
        for i in 0..loops.len() {
            match loops[i].parent {
                Some(p) => {
                    loops[i].depth = loops[p.index()].depth + 1;
                    let id = loops[i].id;
                    loops[p.index()].children.push(id);
                }
                None => top_level.push(loops[i].id),
            }
        }

        let mut innermost: Vec<Option<LoopId>> = vec![None; cap];
        for l in &loops {
            for b in &l.blocks {
                let slot = &mut innermost[b.index()];
                let replace = match slot {
                    Some(cur) => l.num_blocks() < loops[cur.index()].num_blocks(),
                    None => true,
                };
                if replace {
                    *slot = Some(l.id);
                }
            }
        }

        for l in loops.iter_mut() {
            describe_loop(func, cfg, l);
        }

        Self { loops, top_level, innermost }
    }

    pub fn get(&self, id: LoopId) -> &Loop {
        &self.loops[id.index()]
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Outermost loops in program order.
    pub fn top_level(&self) -> &[LoopId] {
        &self.top_level
    }

    /// Innermost loop containing `block`.
    pub fn loop_for(&self, block: BlockId) -> Option<LoopId> {
        self.innermost.get(block.index()).copied().flatten()
    }

    /// Loop whose header is `header`.
    pub fn loop_with_header(&self, header: BlockId) -> Option<LoopId> {
        self.loops.iter().find(|l| l.header == header).map(|l| l.id)
    }

    /// Every loop, each followed by its sub-loops, siblings in program order.
    pub fn preorder(&self) -> Vec<LoopId> {
        let mut order = Vec::with_capacity(self.loops.len());
        let mut stack: Vec<LoopId> = self.top_level.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.get(id).children.iter().rev().copied());
        }
        order
    }

    /// Whether `outer` is `inner` or one of its ancestors.
    pub fn encloses(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = Some(inner);
        while let Some(id) = cur {
            if id == outer {
                return true;
            }
            cur = self.get(id).parent;
        }
        false
    }
}

fn describe_loop(func: &Function, cfg: &ControlFlowGraph, l: &mut Loop) {
    for &b in &l.blocks {
        let mut exits_here = false;
        for &s in cfg.succs(b) {
            if l.contains(s) {
                continue;
            }
            exits_here = true;
            if !l.exits.contains(&s) {
                l.exits.push(s);
            }
            if !l.latches.contains(&b) && !l.non_latch_exits.contains(&s) {
                l.non_latch_exits.push(s);
            }
        }
        if exits_here {
            l.exiting.push(b);
        }
    }

    let outside: Vec<BlockId> = cfg.preds(l.header).iter().copied().filter(|p| !l.contains(*p)).collect();
    if let [pred] = outside.as_slice() {
        if cfg.succs(*pred) == [l.header] {
            l.preheader = Some(*pred);
        }
    }

    if let Some(preheader) = l.preheader {
        l.guard = find_guard(func, cfg, l, preheader);
    }

    if let (Some(preheader), Some(latch)) = (l.preheader, l.latch()) {
        l.iv = find_induction_variable(func, l.header, preheader, latch);
    }
}

/// A guard is the sole predecessor of the preheader whose conditional branch
/// either enters the preheader or bypasses the loop to where its exit leads.
fn find_guard(func: &Function, cfg: &ControlFlowGraph, l: &Loop, preheader: BlockId) -> Option<BlockId> {
    let [guard] = cfg.preds(preheader) else {
        return None;
    };
    if l.contains(*guard) {
        return None;
    }
    let term = func.terminator(*guard)?;
    let InstKind::CondBr { then_dest, else_dest, .. } = func.inst(term).kind else {
        return None;
    };
    let other = if then_dest == preheader {
        else_dest
    } else if else_dest == preheader {
        then_dest
    } else {
        return None;
    };
    let [exit] = l.exits.as_slice() else {
        return None;
    };
    let after_exit = match func.block(*exit).insts.as_slice() {
        [only] => match func.inst(*only).kind {
            InstKind::Br { target } => Some(target),
            _ => None,
        },
        _ => None,
    };
    (other == *exit || Some(other) == after_exit).then_some(*guard)
}

fn find_induction_variable(func: &Function, header: BlockId, preheader: BlockId, latch: BlockId) -> Option<InductionVariable> {
    for phi in func.phis(header) {
        let InstKind::Phi { incoming } = &func.inst(phi).kind else {
            continue;
        };
        if incoming.len() != 2 {
            continue;
        }
        let start = incoming.iter().find(|(b, _)| *b == preheader).map(|(_, v)| *v);
        let from_latch = incoming.iter().find(|(b, _)| *b == latch).map(|(_, v)| *v);
        let (Some(start), Some(Value::Inst(next))) = (start, from_latch) else {
            continue;
        };
        let this = Value::Inst(phi);
        let step = match func.inst(next).kind {
            InstKind::Binary { op: BinaryOp::Add, lhs, rhs: Value::Const(c) } if lhs == this => Some(c),
            InstKind::Binary { op: BinaryOp::Add, lhs: Value::Const(c), rhs } if rhs == this => Some(c),
            InstKind::Binary { op: BinaryOp::Sub, lhs, rhs: Value::Const(c) } if lhs == this => c.checked_neg(),
            _ => None,
        };
        if let Some(step) = step.filter(|s| *s != 0) {
            return Some(InductionVariable { phi, start, step, next });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpPred, FunctionBuilder, Type};

    fn analyze(f: &Function) -> LoopInfo {
        let cfg = ControlFlowGraph::compute(f);
        let dom = DominatorTree::from_cfg(&cfg);
        LoopInfo::compute(f, &cfg, &dom)
    }

    #[test]
    fn test_single_loop() {
        let mut b = FunctionBuilder::new("f");
        let lp = b.counted_loop("i", Value::Const(0), Value::Const(8), 1, |_, _| {});
        b.ret(None);
        let f = b.finish();
        let li = analyze(&f);

        assert_eq!(li.len(), 1);
        let l = li.get(li.top_level()[0]);
        assert_eq!(l.header(), lp.header);
        assert_eq!(l.latch(), Some(lp.latch));
        assert_eq!(l.preheader(), Some(lp.preheader));
        assert_eq!(l.exit_blocks(), &[lp.exit]);
        assert_eq!(l.non_latch_exit_blocks(), &[lp.exit]);
        assert_eq!(l.exiting_blocks(), &[lp.header]);
        assert_eq!(l.body_blocks(), vec![lp.body]);
        assert!(l.is_simplified());
        assert!(!l.is_guarded());
        let iv = l.induction_variable().unwrap();
        assert_eq!(iv.value(), lp.iv);
        assert!(iv.is_canonical());
        assert_eq!(li.loop_for(lp.body), Some(l.id()));
        assert_eq!(li.loop_for(lp.exit), None);
    }

    #[test]
    fn test_nested_preorder() {
        let mut b = FunctionBuilder::new("f");
        let mut inner = None;
        let outer = b.counted_loop("i", Value::Const(0), Value::Const(4), 1, |b, _| {
            inner = Some(b.counted_loop("j", Value::Const(0), Value::Const(4), 1, |_, _| {}));
        });
        let sibling = b.counted_loop("k", Value::Const(0), Value::Const(4), 1, |_, _| {});
        b.ret(None);
        let f = b.finish();
        let inner = inner.unwrap();
        let li = analyze(&f);

        let headers: Vec<BlockId> = li.preorder().iter().map(|id| li.get(*id).header()).collect();
        assert_eq!(headers, vec![outer.header, inner.header, sibling.header]);

        let i = li.loop_with_header(outer.header).unwrap();
        let j = li.loop_with_header(inner.header).unwrap();
        let k = li.loop_with_header(sibling.header).unwrap();
        assert_eq!(li.get(j).parent(), Some(i));
        assert_eq!(li.get(j).depth(), 2);
        assert_eq!(li.get(k).depth(), 1);
        assert_eq!(li.loop_for(inner.body), Some(j));
        assert!(li.encloses(i, j));
        assert!(!li.encloses(j, i));
        assert!(li.get(i).contains(inner.exit));
    }

    #[test]
    fn test_guarded_loop() {
        let mut b = FunctionBuilder::new("f");
        let n = b.param("n", Type::Int);
        let preheader = b.create_block("ph");
        let after = b.create_block("after");
        let guard = b.current_block();
        let c = b.cmp(CmpPred::Sgt, n, Value::Const(0));
        b.cond_br(c, preheader, after);
        b.switch_to(preheader);
        let lp = b.counted_loop("i", Value::Const(0), n, 1, |_, _| {});
        b.br(after);
        b.switch_to(after);
        b.ret(None);
        let f = b.finish();
        let li = analyze(&f);

        let l = li.get(li.top_level()[0]);
        assert_eq!(l.preheader(), Some(lp.preheader));
        assert_eq!(l.guard(), Some(guard));
        assert_eq!(l.entry_block(), Some(guard));
    }

    #[test]
    fn test_loop_without_induction_variable() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param("x", Type::Int);
        let header = b.create_block("h");
        let exit = b.create_block("x");
        b.br(header);
        b.switch_to(header);
        let c = b.cmp(CmpPred::Sgt, x, Value::Const(0));
        b.cond_br(c, header, exit);
        b.switch_to(exit);
        b.ret(None);
        let f = b.finish();
        let li = analyze(&f);

        let l = li.get(li.top_level()[0]);
        assert_eq!(l.latch(), Some(header));
        assert!(l.induction_variable().is_none());
        assert!(!l.is_simplified());
    }
}
