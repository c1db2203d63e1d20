//! Local generation errors.
//!
//! # Error Hierarchy
//!
//! The crate uses a three-layer error hierarchy:
//!
//! ## Local Layer (`crate::error`)
//!
//! - [`GenerationError`]: compare-and-swap conflicts and rejected transitions
//!   raised by the generation store and state machine.
//!
//! ## Transport Layer (`crate::gossip::error`)
//!
//! - [`GossipError`]: peer unreachable, timeouts, remote conflicts and
//!   rejections, malformed payloads.
//!
//! ## Driver Layer (`crate::generation::driver`)
//!
//! - [`TransitionError`]: the outcome of an aborted leader-side transition.
//!
//! # Classes
//!
//! | Class      | Variant                      | Caller action                     |
//! |------------|------------------------------|-----------------------------------|
//! | Transport  | `GossipError::Unreachable`   | retry with backoff                |
//! | Conflict   | `GenerationError::Conflict`  | re-read, re-propose or abandon    |
//! | Violation  | `GenerationError::Rejected`  | log, never retried automatically  |
//! | Encoding   | `GossipError::Encoding`      | fail the single exchange          |
//!
//! [`GossipError`]: crate::gossip::GossipError
//! [`TransitionError`]: crate::generation::TransitionError

use thiserror::Error;

use crate::types::{GenStatus, Token, TransactionId};

/// Result type for local generation operations.
pub type GenerationResult<T> = Result<T, GenerationError>;

/// Why a requested transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// The request carried a status the operation does not accept.
    #[error("expected status {expected}, got {actual}")]
    InvalidStatus {
        expected: GenStatus,
        actual: GenStatus,
    },

    /// The stored record is terminal and cannot transition.
    #[error("generation is {status} and cannot transition to {requested}")]
    TerminalState {
        status: GenStatus,
        requested: GenStatus,
    },

    /// Commit must wait for the follower acknowledgements.
    #[error("generation is {status}, commit requires accepted")]
    NotAccepted { status: GenStatus },

    /// The version does not follow the last committed version.
    #[error("stale version {actual}, expected {expected}")]
    StaleVersion { expected: u32, actual: u32 },

    /// No record carries the referenced transaction.
    #[error("no generation with transaction {tx}")]
    UnknownTransaction { tx: TransactionId },

    /// Committed generations are never cancelled or edited.
    #[error("committed generation {tx} is immutable")]
    CommittedImmutable { tx: TransactionId },

    /// Another range holds an in-flight or committed generation covering
    /// part of the requested range.
    #[error("range overlaps generation {tx} starting at token {start}")]
    Overlap { start: Token, tx: TransactionId },

    /// A required field is missing or inconsistent.
    #[error("malformed generation: {0}")]
    Malformed(String),
}

/// Errors raised by the local generation store and state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The stored transaction did not match the expected one.
    ///
    /// A concurrent transition already happened; the caller must re-read the
    /// current state and decide whether to re-propose or abandon.
    #[error("conflict on token {token}: expected tx {expected:?}, found {actual:?}")]
    Conflict {
        token: Token,
        expected: Option<TransactionId>,
        actual: Option<TransactionId>,
    },

    /// The transition is not permitted from the stored state.
    #[error("transition rejected on token {token}: {reason}")]
    Rejected { token: Token, reason: RejectReason },
}

impl GenerationError {
    /// Check if this error signals a concurrent transition.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, GenerationError::Conflict { .. })
    }

    /// Check if this error signals a protocol violation.
    #[inline]
    pub fn is_rejected(&self) -> bool {
        matches!(self, GenerationError::Rejected { .. })
    }

    pub fn token(&self) -> Token {
        match self {
            GenerationError::Conflict { token, .. } | GenerationError::Rejected { token, .. } => {
                *token
            }
        }
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            GenerationError::Conflict { .. } => "conflict",
            GenerationError::Rejected { .. } => "rejected",
        }
    }
}
