//! Analyses the fusion pass consumes.
//!
//! Every analysis is computed from an immutable borrow of the function, so
//! none of them can outlive a CFG mutation.

pub mod access;
pub mod cfg;
pub mod dependence;
pub mod dominators;
pub mod loops;
pub mod scev;

pub use access::{resolve, AffineAccess, MemoryAccesses};
pub use cfg::ControlFlowGraph;
pub use dependence::{DependenceAnalysis, DependenceInfo, DependenceKind, DependenceOracle, Direction};
pub use dominators::{DominatorTree, PostDominatorTree};
pub use loops::{InductionVariable, Loop, LoopId, LoopInfo};
pub use scev::{Scev, ScalarEvolution, SymbolicEngine, SymbolicExpr};

use crate::ir::Function;

/// Structural analyses of one function.
pub struct AnalysisContext<'a> {
    pub func: &'a Function,
    pub cfg: ControlFlowGraph,
    pub dom: DominatorTree,
    pub post_dom: PostDominatorTree,
    pub loops: LoopInfo,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(func: &'a Function) -> Self {
        let cfg = ControlFlowGraph::compute(func);
        let dom = DominatorTree::from_cfg(&cfg);
        let post_dom = PostDominatorTree::from_cfg(&cfg);
        let loops = LoopInfo::compute(func, &cfg, &dom);
        Self { func, cfg, dom, post_dom, loops }
    }

    /// Symbolic engine over this function's loop forest.
    pub fn scalar_evolution(&self) -> ScalarEvolution<'_> {
        ScalarEvolution::new(self.func, &self.loops)
    }
}
