//! Error types for the loop fusion framework.
//!
//! This module defines all error types used throughout the crate,
//! organized by the phase that produces them.

use crate::ir::BlockId;
use serde::Serialize;
use thiserror::Error;
use std::fmt;

/// Top-level error type for the optimizer.
#[derive(Error, Debug)]
pub enum LoopFuseError {
    /// A fusion candidate failed a legality check
    #[error("Legality error: {0}")]
    Legality(#[from] LegalityError),

    /// Error during the structural transformation
    #[error("Transformation error: {0}")]
    Transform(#[from] TransformError),

    /// The IR is not well formed
    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reason a candidate pair was rejected for fusion.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegalityError {
    /// The error message
    pub message: String,
    /// The kind of legality failure
    pub kind: LegalityErrorKind,
}

impl LegalityError {
    /// Create a new legality error.
    pub fn new(kind: LegalityErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind }
    }
}

impl fmt::Display for LegalityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalityErrorKind {
    /// The first loop does not hand off to the second loop's entry
    NotAdjacent,
    /// Backedge-taken counts differ or could not be compared
    TripCountMismatch,
    /// The loops do not always execute together
    NotFlowEquivalent,
    /// A symbolic query could not be answered
    UnresolvedSymbolic,
    /// Loop not in simplified form
    MalformedLoopShape,
    /// The dependence oracle could not classify a conflict
    UnknownDependenceDirection,
    /// A cross-loop dependence would be reversed by fusion
    NegativeDistance,
    /// The second loop consumes a value computed inside the first loop
    ScalarDependence,
    /// The induction variables start or step differently
    InductionVariableMismatch,
}

impl LegalityErrorKind {
    /// Short name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            LegalityErrorKind::NotAdjacent => "not adjacent",
            LegalityErrorKind::TripCountMismatch => "trip count mismatch",
            LegalityErrorKind::NotFlowEquivalent => "not flow equivalent",
            LegalityErrorKind::UnresolvedSymbolic => "unresolved symbolic",
            LegalityErrorKind::MalformedLoopShape => "malformed loop shape",
            LegalityErrorKind::UnknownDependenceDirection => "unknown dependence direction",
            LegalityErrorKind::NegativeDistance => "negative dependence distance",
            LegalityErrorKind::ScalarDependence => "scalar dependence",
            LegalityErrorKind::InductionVariableMismatch => "induction variable mismatch",
        }
    }
}

/// Error during transformation.
#[derive(Error, Debug, Clone)]
pub struct TransformError {
    /// The error message
    pub message: String,
    /// The kind of transformation error
    pub kind: TransformErrorKind,
    /// The transformation that failed
    pub transform: String,
}

impl TransformError {
    /// Create a structural invariant violation for the given transform.
    pub fn structural(transform: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransformErrorKind::StructuralInvariant,
            transform: transform.to_string(),
        }
    }

    pub fn not_applicable(transform: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransformErrorKind::NotApplicable,
            transform: transform.to_string(),
        }
    }

    pub fn verification_failed(transform: &str, err: &VerifyError) -> Self {
        Self {
            message: format!("verification failed: {}", err),
            kind: TransformErrorKind::VerificationFailed,
            transform: transform.to_string(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.message, self.transform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorKind {
    /// The CFG does not have the shape the transform requires
    StructuralInvariant,
    /// Transformation not applicable to the given loops
    NotApplicable,
    /// The transformed function failed verification
    VerificationFailed,
}

/// The IR violates a well-formedness rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    /// The error message
    pub message: String,
    /// Offending block, if any
    pub block: Option<BlockId>,
}

impl VerifyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), block: None }
    }

    pub fn in_block(block: BlockId, message: impl Into<String>) -> Self {
        Self { message: message.into(), block: Some(block) }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(block) => write!(f, "{} (in {})", self.message, block),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Result type using LoopFuseError.
pub type FuseResult<T> = Result<T, LoopFuseError>;
