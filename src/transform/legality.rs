//! Legality checks for fusing two sibling loops.
//!
//! Each check is a predicate over the two loops and the analyses of the
//! enclosing function. The `check_*` methods explain a rejection through a
//! [`LegalityError`]; the boolean forms simply discard the reason. Every
//! check fails closed: anything that cannot be proven counts as illegal.

use crate::analysis::{
    resolve, AnalysisContext, DependenceInfo, DependenceOracle, Direction, DominatorTree, Loop, LoopId, LoopInfo,
    MemoryAccesses, PostDominatorTree, SymbolicEngine, SymbolicExpr,
};
use crate::ir::{CmpPred, Function, InstId, InstKind, Value};
use crate::utils::errors::{LegalityError, LegalityErrorKind};
use log::{debug, warn};
use std::collections::HashSet;

/// Two loops at the same depth under the same parent, `first` running
/// before `second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FusionCandidate {
    pub first: LoopId,
    pub second: LoopId,
}

fn reject(kind: LegalityErrorKind, message: impl Into<String>) -> LegalityError {
    let err = LegalityError::new(kind, message);
    debug!("fusion rejected: {}", err);
    err
}

/// Legality predicates over one function's analyses.
pub struct LegalityChecker<'a> {
    func: &'a Function,
    loops: &'a LoopInfo,
    dom: &'a DominatorTree,
    post_dom: &'a PostDominatorTree,
    engine: &'a dyn SymbolicEngine,
    oracle: &'a dyn DependenceOracle,
    check_output_dependences: bool,
}

impl<'a> LegalityChecker<'a> {
    pub fn new(ctx: &'a AnalysisContext<'_>, engine: &'a dyn SymbolicEngine, oracle: &'a dyn DependenceOracle) -> Self {
        Self {
            func: ctx.func,
            loops: &ctx.loops,
            dom: &ctx.dom,
            post_dom: &ctx.post_dom,
            engine,
            oracle,
            check_output_dependences: true,
        }
    }

    /// Also require store/store pairs across the loops to pass the distance test.
    pub fn with_output_dependences(mut self, enabled: bool) -> Self {
        self.check_output_dependences = enabled;
        self
    }

    /// Run every check in order, stopping at the first failure.
    pub fn check_candidate(&self, candidate: FusionCandidate) -> Result<(), LegalityError> {
        let a = self.loops.get(candidate.first);
        let b = self.loops.get(candidate.second);
        if a.parent() != b.parent() || a.depth() != b.depth() {
            return Err(reject(
                LegalityErrorKind::NotAdjacent,
                format!("{} and {} are not siblings", self.name(a), self.name(b)),
            ));
        }
        self.check_loop_shape(a)?;
        self.check_loop_shape(b)?;
        self.check_adjacent(a, b)?;
        self.check_same_trip_count(a, b)?;
        self.check_flow_equivalent(a, b)?;
        self.check_induction_variables(a, b)?;
        self.check_scalar_flow(a, b)?;
        self.check_distance_independent(a, b)
    }

    fn name(&self, l: &Loop) -> String {
        format!("loop {}", self.func.block_name(l.header()))
    }

    /// Simplified form with a single exit tested only in the header, and a
    /// latch holding nothing but the induction step and the back edge.
    pub fn check_loop_shape(&self, l: &Loop) -> Result<(), LegalityError> {
        let malformed = |what: &str| reject(LegalityErrorKind::MalformedLoopShape, format!("{} {}", self.name(l), what));

        if !l.is_simplified() {
            return Err(malformed("is not in simplified form"));
        }
        let [exit] = l.exit_blocks() else {
            return Err(malformed("does not have a single exit block"));
        };
        if l.exiting_blocks() != [l.header()] {
            return Err(malformed("exits from a block other than its header"));
        }
        let term = self.func.terminator(l.header()).ok_or_else(|| malformed("has an unterminated header"))?;
        let InstKind::CondBr { then_dest, else_dest, .. } = self.func.inst(term).kind else {
            return Err(malformed("header does not end in a conditional branch"));
        };
        let in_loop = if l.contains(then_dest) { then_dest } else { else_dest };
        let out = if in_loop == then_dest { else_dest } else { then_dest };
        if !l.contains(in_loop) || out != *exit {
            return Err(malformed("header does not branch between body and exit"));
        }
        let latch = l.latch().ok_or_else(|| malformed("has no unique latch"))?;
        let latch_term = self.func.terminator(latch).map(|t| &self.func.inst(t).kind);
        if latch_term != Some(&InstKind::Br { target: l.header() }) {
            return Err(malformed("latch does not branch unconditionally to the header"));
        }
        // After fusion the first latch runs behind the second body, so it may
        // only step the induction variable.
        let step = l.induction_variable().map(|iv| iv.next);
        let stray = self
            .func
            .block(latch)
            .insts
            .iter()
            .filter(|i| Some(**i) != step && !self.func.inst(**i).kind.is_terminator())
            .count();
        if stray > 0 {
            return Err(malformed("latch does more than step the induction variable"));
        }
        Ok(())
    }

    /// Every non-latch exit of `a` is the entry of `b`, and that hand-off
    /// block does nothing but transfer control.
    pub fn check_adjacent(&self, a: &Loop, b: &Loop) -> Result<(), LegalityError> {
        let not_adjacent = |msg: String| reject(LegalityErrorKind::NotAdjacent, msg);

        let entry = b
            .entry_block()
            .ok_or_else(|| not_adjacent(format!("{} has neither preheader nor guard", self.name(b))))?;
        let exits = a.non_latch_exit_blocks();
        if exits.is_empty() {
            return Err(not_adjacent(format!("{} has no exit", self.name(a))));
        }
        if let Some(exit) = exits.iter().find(|e| **e != entry) {
            return Err(not_adjacent(format!(
                "exit {} of {} is not the entry {} of {}",
                self.func.block_name(*exit),
                self.name(a),
                self.func.block_name(entry),
                self.name(b)
            )));
        }

        let insts = &self.func.block(entry).insts;
        let clean = if b.is_guarded() {
            insts.len() <= 2
                && insts
                    .iter()
                    .all(|i| matches!(self.func.inst(*i).kind, InstKind::Cmp { .. } | InstKind::CondBr { .. }))
        } else {
            insts.len() == 1
        };
        if !clean {
            return Err(not_adjacent(format!(
                "hand-off block {} has {} instructions",
                self.func.block_name(entry),
                insts.len()
            )));
        }
        Ok(())
    }

    pub fn is_adjacent(&self, a: &Loop, b: &Loop) -> bool {
        self.check_adjacent(a, b).is_ok()
    }

    /// Backedge-taken counts must be computable and structurally equal.
    pub fn check_same_trip_count(&self, a: &Loop, b: &Loop) -> Result<(), LegalityError> {
        let count = |l: &Loop| {
            self.engine.backedge_taken_count(l.id()).ok_or_else(|| {
                reject(
                    LegalityErrorKind::UnresolvedSymbolic,
                    format!("backedge-taken count of {} could not be computed", self.name(l)),
                )
            })
        };
        let (ca, cb) = (count(a)?, count(b)?);
        if ca != cb {
            return Err(reject(
                LegalityErrorKind::TripCountMismatch,
                format!("{} runs {} times but {} runs {} times", self.name(a), ca, self.name(b), cb),
            ));
        }
        Ok(())
    }

    pub fn same_trip_count(&self, a: &Loop, b: &Loop) -> bool {
        self.check_same_trip_count(a, b).is_ok()
    }

    /// `a` dominates `b` and `b` post-dominates `a`.
    pub fn check_flow_equivalent(&self, a: &Loop, b: &Loop) -> Result<(), LegalityError> {
        if self.dom.dominates(a.header(), b.header()) && self.post_dom.dominates(b.header(), a.header()) {
            Ok(())
        } else {
            Err(reject(
                LegalityErrorKind::NotFlowEquivalent,
                format!("{} and {} do not always execute together", self.name(a), self.name(b)),
            ))
        }
    }

    pub fn flow_equivalent(&self, a: &Loop, b: &Loop) -> bool {
        self.check_flow_equivalent(a, b).is_ok()
    }

    /// Replacing one induction variable by the other must not change values.
    pub fn check_induction_variables(&self, a: &Loop, b: &Loop) -> Result<(), LegalityError> {
        let mismatch = |msg: &str| {
            reject(
                LegalityErrorKind::InductionVariableMismatch,
                format!("{} and {}: {}", self.name(a), self.name(b), msg),
            )
        };
        let (Some(iva), Some(ivb)) = (a.induction_variable(), b.induction_variable()) else {
            return Err(mismatch("missing induction variable"));
        };
        if iva.step != ivb.step {
            return Err(mismatch("steps differ"));
        }
        let start_a = self.engine.expr_at_scope(iva.start, Some(a.id()));
        let start_b = self.engine.expr_at_scope(ivb.start, Some(b.id()));
        match (start_a.as_invariant(), start_b.as_invariant()) {
            (Some(sa), Some(sb)) if sa == sb => Ok(()),
            (Some(_), Some(_)) => Err(mismatch("start values differ")),
            _ => Err(reject(
                LegalityErrorKind::UnresolvedSymbolic,
                format!("start values of {} and {} could not be compared", self.name(a), self.name(b)),
            )),
        }
    }

    /// `b` must not consume any value defined inside `a`, whether directly
    /// or through instructions and phis between the two loops.
    pub fn check_scalar_flow(&self, a: &Loop, b: &Loop) -> Result<(), LegalityError> {
        let mut worklist: Vec<InstId> = Vec::new();
        let mut visited: HashSet<InstId> = HashSet::new();
        for &block in b.blocks() {
            for &inst in &self.func.block(block).insts {
                let kind = &self.func.inst(inst).kind;
                worklist.extend(kind.operands().iter().filter_map(Value::as_inst));
            }
        }
        if let Some(iv) = b.induction_variable() {
            worklist.extend(iv.start.as_inst());
        }

        while let Some(def) = worklist.pop() {
            if !visited.insert(def) {
                continue;
            }
            let inst = self.func.inst(def);
            if a.contains(inst.block) {
                return Err(reject(
                    LegalityErrorKind::ScalarDependence,
                    format!("{} uses {} defined in {}", self.name(b), self.func.value_name(def.into()), self.name(a)),
                ));
            }
            if b.contains(inst.block) {
                continue;
            }
            worklist.extend(inst.kind.operands().iter().filter_map(Value::as_inst));
        }
        Ok(())
    }

    /// Every cross-loop conflict must have a provably non-negative distance.
    pub fn check_distance_independent(&self, a: &Loop, b: &Loop) -> Result<(), LegalityError> {
        let in_a = MemoryAccesses::collect(self.func, a);
        let in_b = MemoryAccesses::collect(self.func, b);

        let mut pairs: Vec<(InstId, InstId)> = Vec::new();
        for &store in &in_a.stores {
            pairs.extend(in_b.loads.iter().map(|&load| (store, load)));
        }
        for &load in &in_a.loads {
            pairs.extend(in_b.stores.iter().map(|&store| (load, store)));
        }
        if self.check_output_dependences {
            for &store in &in_a.stores {
                pairs.extend(in_b.stores.iter().map(|&other| (store, other)));
            }
        }

        for (first, second) in pairs {
            let Some(dep) = self.oracle.depends(first, second, true) else {
                continue;
            };
            if dep.is_input() || (dep.is_output() && !self.check_output_dependences) {
                continue;
            }
            debug!("checking dependence {}", dep.description(self.func));
            self.check_dependence_distance(a, b, &dep)?;
        }
        Ok(())
    }

    pub fn distance_independent(&self, a: &Loop, b: &Loop) -> bool {
        self.check_distance_independent(a, b).is_ok()
    }

    fn check_dependence_distance(&self, a: &Loop, b: &Loop, dep: &DependenceInfo) -> Result<(), LegalityError> {
        let unknown_direction = dep.direction == Direction::Star;
        let unproven = |msg: String| {
            let kind = if unknown_direction {
                LegalityErrorKind::UnknownDependenceDirection
            } else {
                LegalityErrorKind::UnresolvedSymbolic
            };
            reject(kind, msg)
        };
        let what = dep.description(self.func);

        for (access, l) in [(dep.src, a), (dep.dst, b)] {
            if self.loops.loop_for(self.func.inst(access).block) != Some(l.id()) {
                return Err(unproven(format!("{}: access inside a sub-loop of {}", what, self.name(l))));
            }
        }

        let (Some(ra), Some(rb)) = (
            resolve(self.engine, self.func, dep.src, a.id()),
            resolve(self.engine, self.func, dep.dst, b.id()),
        ) else {
            return Err(unproven(format!("{}: address is not an affine recurrence", what)));
        };
        if !self.engine.is_known_non_zero(&ra.stride) || !self.engine.is_known_non_zero(&rb.stride) {
            return Err(unproven(format!("{}: stride not known to be non-zero", what)));
        }
        if ra.stride != rb.stride {
            return Err(unproven(format!("{}: strides {} and {} differ", what, ra.stride, rb.stride)));
        }

        let distance = self
            .engine
            .minus(&ra.start, &rb.start)
            .and_then(|delta| self.engine.mul(&delta, &ra.stride))
            .ok_or_else(|| unproven(format!("{}: distance overflows", what)))?;
        let zero = SymbolicExpr::zero();

        if self.engine.is_known_predicate(CmpPred::Sge, &distance, &zero) {
            if dep.direction == Direction::Gt {
                warn!("{}: oracle reports a backward dependence but distance {} is non-negative", what, distance);
            }
            Ok(())
        } else if self.engine.is_known_predicate(CmpPred::Slt, &distance, &zero) {
            if matches!(dep.direction, Direction::Lt | Direction::Eq) {
                warn!("{}: oracle reports a forward dependence but distance {} is negative", what, distance);
            }
            Err(reject(
                LegalityErrorKind::NegativeDistance,
                format!("{}: distance {} is negative", what, distance),
            ))
        } else {
            Err(unproven(format!("{}: sign of distance {} is unknown", what, distance)))
        }
    }
}
