//! Loop fusion: legality checks, the CFG transformation and the driver.

pub mod fusion;
pub mod legality;
pub mod pipeline;

pub use fusion::{fuse, fuse_checked, Fusion, FusionPlan, LoopShape};
pub use legality::{FusionCandidate, LegalityChecker};
pub use pipeline::{FusedPair, FusionConfig, FusionPass, FusionResult, RejectedPair};

use crate::ir::{Function, Module};
use anyhow::Result;

/// Run the fusion pass with the given configuration on one function.
pub fn fuse_loops(func: &mut Function, config: FusionConfig) -> Result<FusionResult> {
    FusionPass::new(config).run(func)
}

/// Run the fusion pass on every function of a module.
pub fn fuse_module(module: &mut Module, config: FusionConfig) -> Result<Vec<FusionResult>> {
    FusionPass::new(config).run_module(module)
}

/// Transformation pass trait.
pub trait Transform {
    /// Apply the transformation. Returns whether the function changed.
    fn apply(&self, func: &mut Function) -> Result<bool>;

    /// Check if the transformation can be applied to the function as it is.
    fn is_legal(&self, func: &Function) -> bool;

    /// Get transformation name.
    fn name(&self) -> &str;
}
