//! Utility modules shared across the crate:
//! - Error types
//! - Symbol interning
//! - IR pretty printing

pub mod errors;
pub mod intern;
pub mod pretty;

// Re-exports
pub use errors::*;
pub use intern::{intern, Symbol};
pub use pretty::PrettyPrint;
