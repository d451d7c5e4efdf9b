//! Memory accesses of a loop and their affine address forms.

use super::loops::{Loop, LoopId};
use super::scev::{Scev, SymbolicEngine, SymbolicExpr};
use crate::ir::{Function, InstId};
use std::fmt;

/// Loads and stores found in a loop, sub-loops included, in layout order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryAccesses {
    pub loads: Vec<InstId>,
    pub stores: Vec<InstId>,
}

impl MemoryAccesses {
    pub fn collect(func: &Function, l: &Loop) -> Self {
        let mut accesses = Self::default();
        for &block in l.blocks() {
            for &inst in &func.block(block).insts {
                let kind = &func.inst(inst).kind;
                if kind.writes_memory() {
                    accesses.stores.push(inst);
                } else if kind.is_memory_access() {
                    accesses.loads.push(inst);
                }
            }
        }
        accesses
    }

    pub fn len(&self) -> usize {
        self.loads.len() + self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address of an access as `start + stride * k` on iteration `k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineAccess {
    pub start: SymbolicExpr,
    pub stride: SymbolicExpr,
}

impl fmt::Display for AffineAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},+,{}}}", self.start, self.stride)
    }
}

/// Resolve the address of `access` to a recurrence over `loop_id`.
///
/// Only a first-order recurrence of exactly that loop is accepted; invariant
/// addresses, recurrences of other loops and anything the engine cannot
/// describe resolve to `None`.
pub fn resolve<E: SymbolicEngine + ?Sized>(
    engine: &E,
    func: &Function,
    access: InstId,
    loop_id: LoopId,
) -> Option<AffineAccess> {
    let addr = func.inst(access).kind.pointer_operand()?;
    match engine.expr_at_scope(addr, Some(loop_id)) {
        Scev::AddRec { start, step, loop_id: l } if l == loop_id => Some(AffineAccess { start, stride: step }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{cfg::ControlFlowGraph, dominators::DominatorTree, loops::LoopInfo, scev::ScalarEvolution};
    use crate::ir::{FunctionBuilder, Type, Value};
    use crate::utils::intern::intern;

    #[test]
    fn test_collect_and_resolve() {
        let mut b = FunctionBuilder::new("f");
        let a = b.param("A", Type::Ptr);
        let n = b.param("n", Type::Int);
        let mut store = None;
        let mut load = None;
        let mut fixed = None;
        let lp = b.counted_loop("i", Value::Const(0), Value::Const(16), 1, |b, i| {
            let twice = b.mul(i, Value::Const(2));
            let idx = b.add(twice, Value::Const(3));
            let p = b.gep(a, idx);
            load = b.load(p).as_inst();
            let q = b.gep(a, n);
            fixed = b.load(q).as_inst();
            store = Some(b.store(p, Value::Const(0)));
        });
        b.ret(None);
        let f = b.finish();

        let cfg = ControlFlowGraph::compute(&f);
        let dom = DominatorTree::from_cfg(&cfg);
        let li = LoopInfo::compute(&f, &cfg, &dom);
        let se = ScalarEvolution::new(&f, &li);
        let l = li.loop_with_header(lp.header).unwrap();

        let accesses = MemoryAccesses::collect(&f, li.get(l));
        assert_eq!(accesses.loads, vec![load.unwrap(), fixed.unwrap()]);
        assert_eq!(accesses.stores, vec![store.unwrap()]);

        let resolved = resolve(&se, &f, store.unwrap(), l).unwrap();
        let start = SymbolicExpr::symbol(intern("%A")).checked_add(&SymbolicExpr::constant(3)).unwrap();
        assert_eq!(resolved, AffineAccess { start, stride: SymbolicExpr::constant(2) });
        assert_eq!(format!("{}", resolved), "{%A + 3,+,2}");

        assert_eq!(resolve(&se, &f, fixed.unwrap(), l), None);
    }
}
