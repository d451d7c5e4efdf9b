//! Fusion driver.
//!
//! The driver walks the loop forest in preorder, remembering for every depth
//! the loop it saw last. A newly visited loop whose remembered neighbour at
//! the same depth shares its parent forms a candidate pair. Illegal pairs just
//! advance the remembered loop. A legal pair is fused; afterwards every
//! analysis is dropped and the scan starts over on the mutated CFG, unless
//! the configuration asks for a single fusion per run.

use super::fusion::{fuse_checked, FusionPlan};
use super::legality::{FusionCandidate, LegalityChecker};
use super::Transform;
use crate::analysis::{AnalysisContext, DependenceAnalysis, LoopId};
use crate::ir::{Function, Module};
use crate::utils::errors::{LegalityError, LegalityErrorKind};
use anyhow::{Context, Result};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Recompute analyses and rescan after each fusion
    pub rescan_after_fusion: bool,
    /// Stop after this many fusions per function
    pub max_fusions: Option<usize>,
    /// Also run the distance test on store/store pairs
    pub check_output_dependences: bool,
    /// Verify the function after each fusion
    pub verify_after_fusion: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rescan_after_fusion: true,
            max_fusions: None,
            check_output_dependences: true,
            verify_after_fusion: true,
        }
    }
}

impl FusionConfig {
    /// At most one fusion per run. The caller re-invokes the pass to fuse more.
    pub fn single_fusion() -> Self {
        Self {
            rescan_after_fusion: false,
            max_fusions: Some(1),
            ..Self::default()
        }
    }

    /// Only flow and anti dependences constrain fusion.
    pub fn ignore_output_dependences() -> Self {
        Self {
            check_output_dependences: false,
            ..Self::default()
        }
    }

    pub fn with_max_fusions(mut self, max: usize) -> Self {
        self.max_fusions = Some(max);
        self
    }

    fn budget_exhausted(&self, fused: usize) -> bool {
        matches!(self.max_fusions, Some(max) if fused >= max)
    }
}

/// Two loops that were fused, by header name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedPair {
    pub first: String,
    pub second: String,
}

/// A candidate pair that was not fused, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedPair {
    pub first: String,
    pub second: String,
    pub reason: LegalityError,
}

/// Outcome of running the driver on one function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionResult {
    pub function: String,
    pub changed: bool,
    /// Candidate pairs examined, summed over all scans
    pub candidates: usize,
    pub fused: Vec<FusedPair>,
    /// Pairs rejected by the last scan
    pub rejected: Vec<RejectedPair>,
    /// Number of scans of the loop forest
    pub rounds: usize,
}

impl FusionResult {
    fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            ..Self::default()
        }
    }
}

/// The loop fusion pass.
#[derive(Debug, Clone, Default)]
pub struct FusionPass {
    config: FusionConfig,
}

impl FusionPass {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuse loops in `func` until no legal candidate remains or the
    /// configuration stops the driver.
    pub fn run(&self, func: &mut Function) -> Result<FusionResult> {
        let mut result = FusionResult::new(&func.name);
        loop {
            if self.config.budget_exhausted(result.fused.len()) {
                trace!("fusion budget exhausted after {} fusions", result.fused.len());
                break;
            }
            result.rounds += 1;
            trace!("scanning {} (round {})", func.name, result.rounds);
            let Some(plan) = self.scan(func, &mut result) else {
                trace!("no legal candidate left in {}", func.name);
                break;
            };

            let pair = FusedPair {
                first: func.block_name(plan.first.header).to_string(),
                second: func.block_name(plan.second.header).to_string(),
            };
            fuse_checked(func, &plan, self.config.verify_after_fusion)
                .with_context(|| format!("fusing {} into {} in {}", pair.second, pair.first, func.name))?;
            result.fused.push(pair);
            result.changed = true;

            if !self.config.rescan_after_fusion {
                break;
            }
        }
        if result.candidates == 0 {
            debug!("no fusion candidates in {}", func.name);
        }
        Ok(result)
    }

    /// Run the pass on every function of a module.
    pub fn run_module(&self, module: &mut Module) -> Result<Vec<FusionResult>> {
        let mut results = Vec::with_capacity(module.functions.len());
        for func in &mut module.functions {
            let result = self.run(func).with_context(|| format!("in function {}", func.name))?;
            results.push(result);
        }
        Ok(results)
    }

    /// One preorder walk. Returns the plan for the first legal pair.
    fn scan(&self, func: &Function, result: &mut FusionResult) -> Option<FusionPlan> {
        let ctx = AnalysisContext::new(func);
        let se = ctx.scalar_evolution();
        let deps = DependenceAnalysis::new(func, &ctx.loops, &se);
        let checker =
            LegalityChecker::new(&ctx, &se, &deps).with_output_dependences(self.config.check_output_dependences);
        let header_name = |id: LoopId| func.block_name(ctx.loops.get(id).header()).to_string();

        result.rejected.clear();
        let mut last_at_depth: HashMap<usize, LoopId> = HashMap::new();
        for id in ctx.loops.preorder() {
            let current = ctx.loops.get(id);
            let Some(prev) = last_at_depth.insert(current.depth(), id) else {
                continue;
            };
            if ctx.loops.get(prev).parent() != current.parent() {
                continue;
            }

            let candidate = FusionCandidate { first: prev, second: id };
            result.candidates += 1;
            trace!("candidate found: {} and {}", header_name(prev), header_name(id));

            let verdict = checker.check_candidate(candidate).and_then(|()| {
                FusionPlan::new(func, &ctx.loops, candidate)
                    .map_err(|err| LegalityError::new(LegalityErrorKind::MalformedLoopShape, err.message))
            });
            match verdict {
                Ok(plan) => {
                    trace!("candidate {} and {} is legal", header_name(prev), header_name(id));
                    return Some(plan);
                }
                Err(reason) => {
                    trace!("candidate {} and {} is illegal: {}", header_name(prev), header_name(id), reason);
                    result.rejected.push(RejectedPair {
                        first: header_name(prev),
                        second: header_name(id),
                        reason,
                    });
                }
            }
        }
        None
    }
}

impl Transform for FusionPass {
    fn apply(&self, func: &mut Function) -> Result<bool> {
        Ok(self.run(func)?.changed)
    }

    /// Whether at least one candidate pair in `func` could be fused.
    fn is_legal(&self, func: &Function) -> bool {
        self.scan(func, &mut FusionResult::new(&func.name)).is_some()
    }

    fn name(&self) -> &str {
        "loop-fusion-driver"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{ControlFlowGraph, DominatorTree, LoopInfo};
    use crate::ir::{verify_function, FunctionBuilder, Type, Value};

    /// `count` independent loops over 0..n, each storing to its own array.
    fn independent_loops(bounds: &[i64]) -> Function {
        let mut b = FunctionBuilder::new("f");
        let arrays: Vec<Value> = (0..bounds.len()).map(|k| b.param(&format!("A{}", k), Type::Ptr)).collect();
        for (k, (&bound, &array)) in bounds.iter().zip(&arrays).enumerate() {
            b.counted_loop(&format!("i{}", k), Value::Const(0), Value::Const(bound), 1, |b, i| {
                let p = b.gep(array, i);
                b.store(p, i);
            });
        }
        b.ret(None);
        b.finish()
    }

    fn loop_count(func: &Function) -> usize {
        let cfg = ControlFlowGraph::compute(func);
        let dom = DominatorTree::from_cfg(&cfg);
        LoopInfo::compute(func, &cfg, &dom).len()
    }

    #[test]
    fn test_rescan_fuses_chain() {
        let mut f = independent_loops(&[50, 50, 50]);
        let result = FusionPass::default().run(&mut f).unwrap();
        assert!(result.changed);
        assert_eq!(result.fused.len(), 2);
        assert_eq!(result.rounds, 3);
        assert_eq!(loop_count(&f), 1);
        assert_eq!(verify_function(&f), Ok(()));
    }

    #[test]
    fn test_single_fusion() {
        let mut f = independent_loops(&[50, 50, 50]);
        let result = FusionPass::new(FusionConfig::single_fusion()).run(&mut f).unwrap();
        assert_eq!(result.fused.len(), 1);
        assert_eq!(result.fused[0], FusedPair { first: "i0.header".into(), second: "i1.header".into() });
        assert_eq!(loop_count(&f), 2);
    }

    #[test]
    fn test_max_fusions() {
        let mut f = independent_loops(&[8, 8, 8, 8]);
        let result = FusionPass::new(FusionConfig::default().with_max_fusions(2)).run(&mut f).unwrap();
        assert_eq!(result.fused.len(), 2);
        assert_eq!(loop_count(&f), 2);
    }

    #[test]
    fn test_rejection_is_reported() {
        let mut f = independent_loops(&[10, 11]);
        let before = f.clone();
        let result = FusionPass::default().run(&mut f).unwrap();
        assert!(!result.changed);
        assert_eq!(result.candidates, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].reason.kind, LegalityErrorKind::TripCountMismatch);
        assert_eq!(f, before);
    }

    #[test]
    fn test_single_loop_has_no_candidates() {
        let mut f = independent_loops(&[10]);
        let pass = FusionPass::default();
        assert!(!pass.is_legal(&f));
        assert!(!pass.apply(&mut f).unwrap());
        let result = pass.run(&mut f).unwrap();
        assert_eq!(result.candidates, 0);
        assert_eq!(result.rounds, 1);
    }

    #[test]
    fn test_is_legal_tracks_candidates() {
        let pass = FusionPass::default();
        let mut f = independent_loops(&[6, 6]);
        assert!(pass.is_legal(&f));
        assert!(!pass.is_legal(&independent_loops(&[6, 7])));
        assert!(pass.apply(&mut f).unwrap());
        assert!(!pass.is_legal(&f));
    }

    #[test]
    fn test_run_module_and_report() {
        let mut module = Module {
            name: "m".into(),
            functions: vec![independent_loops(&[4, 4]), independent_loops(&[4])],
        };
        let results = FusionPass::default().run_module(&mut module).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].changed);
        assert!(!results[1].changed);

        let json = serde_json::to_value(&results[0]).unwrap();
        assert_eq!(json["fused"][0]["first"], "i0.header");
        assert_eq!(json["changed"], true);
    }
}
