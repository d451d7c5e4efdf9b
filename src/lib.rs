//! # LoopFuse - Loop Fusion for an SSA Control-Flow IR
//!
//! Decides whether two adjacent loops can be merged into one and, when they
//! can, rewires the CFG so that a single loop runs both bodies:
//! - Loop-nest discovery, dominators and post-dominators
//! - A symbolic affine-expression engine (scalar evolution)
//! - A dependence oracle with GCD and Banerjee tests
//! - Legality checks: loop shape, adjacency, trip count, control-flow
//!   equivalence, scalar flow and dependence distance
//! - The fusion transformation and a driver that rescans after each fusion
//!
//! ## Architecture
//!
//! ```text
//! Function → CFG/Dominators → LoopInfo → ScalarEvolution → Dependences
//!          → LegalityChecker → FusionPlan → fuse → verify
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use loopfuse::prelude::*;
//!
//! let mut b = FunctionBuilder::new("f");
//! let a = b.param("A", Type::Ptr);
//! let c = b.param("C", Type::Ptr);
//! b.counted_loop("i", Value::Const(0), Value::Const(100), 1, |b, i| {
//!     let p = b.gep(a, i);
//!     b.store(p, i);
//! });
//! b.counted_loop("j", Value::Const(0), Value::Const(100), 1, |b, j| {
//!     let p = b.gep(c, j);
//!     b.store(p, j);
//! });
//! b.ret(None);
//! let mut func = b.finish();
//!
//! let result = loopfuse::fuse_function(&mut func, FusionConfig::default())?;
//! assert_eq!(result.fused.len(), 1);
//! ```

#![warn(clippy::all)]

pub mod analysis;
pub mod ir;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::analysis::{
        AnalysisContext, DependenceAnalysis, DependenceOracle, Loop, LoopId, LoopInfo, ScalarEvolution,
        SymbolicEngine,
    };
    pub use crate::ir::{
        verify_function, BlockId, CountedLoop, Function, FunctionBuilder, InstId, InstKind, Module, Type, Value,
    };
    pub use crate::transform::{Fusion, FusionConfig, FusionPass, FusionResult, LegalityChecker, Transform};
    pub use crate::utils::errors::*;
    pub use crate::utils::pretty::PrettyPrint;
}

use anyhow::Result;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the fusion pass on one function.
pub fn fuse_function(func: &mut ir::Function, config: transform::FusionConfig) -> Result<transform::FusionResult> {
    transform::fuse_loops(func, config)
}

/// Run the fusion pass on every function of a module.
pub fn fuse_module(module: &mut ir::Module, config: transform::FusionConfig) -> Result<Vec<transform::FusionResult>> {
    transform::fuse_module(module, config)
}

/// Verify every function of a module.
pub fn verify_module(module: &ir::Module) -> utils::errors::FuseResult<()> {
    for func in &module.functions {
        ir::verify_function(func)?;
    }
    Ok(())
}

/// Parse a module from its JSON form.
pub fn parse_module(json: &str) -> Result<ir::Module> {
    Ok(serde_json::from_str(json)?)
}
