//! Loop fusion transformation.
//!
//! Two adjacent loops are merged so that each iteration runs the first body
//! and then the second:
//! ```text
//! for i in 0..n { A(i) }          for i in 0..n {
//! for j in 0..n { B(j) }   ==>        A(i)
//!                                     B(i)
//!                                 }
//! ```
//! The first loop keeps its header, latch and induction variable. The second
//! loop's preheader, guard, header and latch are retired. All structural
//! requirements are checked by [`FusionPlan::new`] before the CFG is touched.

use super::legality::{FusionCandidate, LegalityChecker};
use super::Transform;
use crate::analysis::{AnalysisContext, DependenceAnalysis, Loop, LoopInfo};
use crate::ir::{verify_function, BlockId, Function, InstId, InstKind, Value};
use crate::utils::errors::TransformError;
use anyhow::Result;
use log::{debug, info};

const TRANSFORM_NAME: &str = "loop-fusion";

/// The blocks and values of a loop the transformer rewires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopShape {
    pub header: BlockId,
    pub latch: BlockId,
    pub preheader: BlockId,
    pub guard: Option<BlockId>,
    /// The header's in-loop successor
    pub body_head: BlockId,
    /// The latch's only predecessor
    pub body_tail: BlockId,
    pub exit: BlockId,
    pub iv: InstId,
    pub iv_next: InstId,
}

impl LoopShape {
    pub fn of(func: &Function, l: &Loop) -> Result<Self, TransformError> {
        let header = l.header();
        let missing = |what: &str| {
            TransformError::structural(TRANSFORM_NAME, format!("loop {} has no {}", func.block_name(header), what))
        };
        let latch = l.latch().ok_or_else(|| missing("unique latch"))?;
        let preheader = l.preheader().ok_or_else(|| missing("preheader"))?;
        let iv = l.induction_variable().ok_or_else(|| missing("induction variable"))?;
        let [exit] = l.exit_blocks() else {
            return Err(missing("single exit block"));
        };

        let term = func.terminator(header).ok_or_else(|| missing("header terminator"))?;
        let InstKind::CondBr { then_dest, else_dest, .. } = func.inst(term).kind else {
            return Err(missing("conditional header branch"));
        };
        let body_head = match (l.contains(then_dest), l.contains(else_dest)) {
            (true, false) if else_dest == *exit => then_dest,
            (false, true) if then_dest == *exit => else_dest,
            _ => return Err(missing("header branch between body and exit")),
        };
        if body_head == latch || body_head == header {
            return Err(missing("body block"));
        }

        let latch_preds = func.predecessors(latch);
        let [body_tail] = latch_preds.as_slice() else {
            return Err(TransformError::structural(
                TRANSFORM_NAME,
                format!("latch {} does not have a single predecessor", func.block_name(latch)),
            ));
        };
        let body_tail = *body_tail;
        if body_tail == header {
            return Err(missing("body between header and latch"));
        }

        Ok(Self {
            header,
            latch,
            preheader,
            guard: l.guard(),
            body_head,
            body_tail,
            exit: *exit,
            iv: iv.phi,
            iv_next: iv.next,
        })
    }

    /// Block through which control enters the loop.
    pub fn entry(&self) -> BlockId {
        self.guard.unwrap_or(self.preheader)
    }
}

/// A validated recipe for fusing two loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionPlan {
    pub first: LoopShape,
    pub second: LoopShape,
    /// Blocks of the second loop other than its header and latch
    second_body: Vec<BlockId>,
    /// Blocks that disappear: the second loop's preheader, guard, header, latch
    retired: Vec<BlockId>,
    /// Other blocks entering the second loop, redirected to its exit
    redirected: Vec<BlockId>,
    /// Live targets of the guard's bypass edge
    bypass_targets: Vec<BlockId>,
}

impl FusionPlan {
    /// Check every structural precondition of the merge.
    pub fn new(func: &Function, loops: &LoopInfo, candidate: FusionCandidate) -> Result<Self, TransformError> {
        let a = loops.get(candidate.first);
        let b = loops.get(candidate.second);
        let first = LoopShape::of(func, a)?;
        let second = LoopShape::of(func, b)?;
        let fail = |msg: String| Err(TransformError::structural(TRANSFORM_NAME, msg));

        if first.exit != second.entry() {
            return fail(format!(
                "exit {} of the first loop is not the entry {} of the second",
                func.block_name(first.exit),
                func.block_name(second.entry())
            ));
        }

        let latch_insts = &func.block(first.latch).insts;
        if latch_insts.iter().any(|i| *i != first.iv_next && !func.inst(*i).kind.is_terminator()) {
            return fail(format!(
                "latch {} of the first loop would run after the second body",
                func.block_name(first.latch)
            ));
        }

        let mut retired = vec![second.preheader];
        retired.extend(second.guard);
        retired.extend([second.header, second.latch]);

        let header_phis = func.phis(second.header);
        if header_phis != [second.iv] {
            return fail(format!(
                "header {} has {} phis besides its induction variable",
                func.block_name(second.header),
                header_phis.len().saturating_sub(1)
            ));
        }
        if !func.phis(second.exit).is_empty() {
            return fail(format!("exit block {} has phis", func.block_name(second.exit)));
        }

        for &block in &retired {
            for &inst in &func.block(block).insts {
                let kind = &func.inst(inst).kind;
                if kind.writes_memory() {
                    return fail(format!("retired block {} stores to memory", func.block_name(block)));
                }
                if !kind.has_result() || inst == second.iv {
                    continue;
                }
                let escapes = func
                    .users(Value::Inst(inst))
                    .into_iter()
                    .any(|user| !retired.contains(&func.inst(user).block));
                if escapes {
                    return fail(format!(
                        "{} in retired block {} is used after fusion",
                        func.value_name(inst.into()),
                        func.block_name(block)
                    ));
                }
            }
        }

        let redirected: Vec<BlockId> = func
            .predecessors(second.entry())
            .into_iter()
            .filter(|p| *p != first.header && !retired.contains(p))
            .collect();
        let bypass_targets: Vec<BlockId> = match second.guard {
            Some(guard) => func.successors(guard).into_iter().filter(|s| !retired.contains(s)).collect(),
            None => Vec::new(),
        };

        Ok(Self {
            first,
            second,
            second_body: b.body_blocks(),
            retired,
            redirected,
            bypass_targets,
        })
    }

    pub fn retired_blocks(&self) -> &[BlockId] {
        &self.retired
    }

    fn still_applies(&self, func: &Function) -> bool {
        let blocks = [self.first.header, self.first.latch, self.first.body_tail, self.second.body_tail, self.second.exit];
        blocks.iter().chain(&self.retired).chain(&self.second_body).all(|b| func.contains_block(*b))
            && func.terminator(self.second.header).is_some()
    }
}

/// Merge the second loop of `plan` into the first.
pub fn fuse(func: &mut Function, plan: &FusionPlan) -> Result<(), TransformError> {
    if !plan.still_applies(func) {
        return Err(TransformError::not_applicable(TRANSFORM_NAME, "plan refers to blocks that no longer exist"));
    }
    let (a, b) = (&plan.first, &plan.second);

    let replaced = func.replace_all_uses(Value::Inst(b.iv), Value::Inst(a.iv));
    debug!("replaced {} uses of {} with {}", replaced, func.value_name(b.iv.into()), func.value_name(a.iv.into()));

    // The first loop now leaves straight to where the second one did.
    func.replace_successor(a.header, b.entry(), b.exit);
    func.set_terminator(b.header, InstKind::Br { target: b.latch });

    func.replace_successor(a.body_tail, a.latch, b.body_head);
    func.replace_phi_incoming_block(b.body_head, b.header, a.body_tail);
    func.replace_successor(b.body_tail, b.latch, a.latch);
    func.replace_phi_incoming_block(a.latch, a.body_tail, b.body_tail);

    for &pred in &plan.redirected {
        func.replace_successor(pred, b.entry(), b.exit);
    }
    if let Some(guard) = b.guard {
        for &target in &plan.bypass_targets {
            func.remove_phi_incoming(target, guard);
        }
    }

    for &block in &plan.retired {
        func.remove_block(block);
    }
    func.move_blocks_before(&plan.second_body, a.latch);
    Ok(())
}

/// Fuse one specific pair of loops, identified by their headers.
#[derive(Debug, Clone)]
pub struct Fusion {
    pub first_header: BlockId,
    pub second_header: BlockId,
    /// Also check store/store pairs across the loops
    pub check_output_dependences: bool,
    /// Verify the function afterwards, restoring it on failure
    pub verify: bool,
}

impl Fusion {
    pub fn new(first_header: BlockId, second_header: BlockId) -> Self {
        Self { first_header, second_header, check_output_dependences: true, verify: true }
    }

    /// Run the legality checks and build a plan, or explain why not.
    pub fn plan(&self, func: &Function) -> Result<Option<FusionPlan>> {
        let ctx = AnalysisContext::new(func);
        let (Some(first), Some(second)) =
            (ctx.loops.loop_with_header(self.first_header), ctx.loops.loop_with_header(self.second_header))
        else {
            return Ok(None);
        };
        let candidate = FusionCandidate { first, second };
        let se = ctx.scalar_evolution();
        let deps = DependenceAnalysis::new(func, &ctx.loops, &se);
        let checker = LegalityChecker::new(&ctx, &se, &deps).with_output_dependences(self.check_output_dependences);
        if let Err(reason) = checker.check_candidate(candidate) {
            debug!("{} not applied in {}: {}", TRANSFORM_NAME, func.name, reason);
            return Ok(None);
        }
        Ok(Some(FusionPlan::new(func, &ctx.loops, candidate)?))
    }
}

/// Apply a plan and optionally verify, restoring the function on failure.
pub fn fuse_checked(func: &mut Function, plan: &FusionPlan, verify: bool) -> Result<(), TransformError> {
    let snapshot = verify.then(|| func.clone());
    fuse(func, plan)?;
    if let Some(original) = snapshot {
        if let Err(err) = verify_function(func) {
            *func = original;
            return Err(TransformError::verification_failed(TRANSFORM_NAME, &err));
        }
    }
    info!(
        "fused loop {} into loop {} in {}",
        func.block_name(plan.second.header),
        func.block_name(plan.first.header),
        func.name
    );
    Ok(())
}

impl Transform for Fusion {
    fn apply(&self, func: &mut Function) -> Result<bool> {
        let Some(plan) = self.plan(func)? else {
            return Ok(false);
        };
        fuse_checked(func, &plan, self.verify)?;
        Ok(true)
    }

    fn is_legal(&self, func: &Function) -> bool {
        matches!(self.plan(func), Ok(Some(_)))
    }

    fn name(&self) -> &str {
        TRANSFORM_NAME
    }
}
