//! SSA control-flow IR the fusion pass operates on.
//!
//! - `function`: arena-backed functions, blocks and instructions
//! - `builder`: convenience construction, including counted loops
//! - `verify`: well-formedness checks

pub mod builder;
pub mod function;
pub mod verify;

pub use builder::{CountedLoop, FunctionBuilder};
pub use function::*;
pub use verify::verify_function;
