//! Gossip transport errors and the structured error body carried on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{GenerationError, RejectReason};
use crate::types::Ordinal;

/// Result type for gossip operations.
pub type GossipResult<T> = Result<T, GossipError>;

/// Errors raised by the gossip transport.
#[derive(Debug, Error)]
pub enum GossipError {
    /// The peer could not be reached or the connection dropped mid-call.
    #[error("peer {ordinal} unreachable: {reason}")]
    Unreachable { ordinal: Ordinal, reason: String },

    /// The peer did not answer in time.
    #[error("request to peer {ordinal} timed out after {after:?}")]
    Timeout { ordinal: Ordinal, after: Duration },

    /// No connection is known for the ordinal.
    #[error("unknown peer {0}")]
    UnknownPeer(Ordinal),

    /// The peer refused the write because its stored transaction differs.
    #[error("conflict reported by peer {ordinal}: {message}")]
    Conflict { ordinal: Ordinal, message: String },

    /// The peer refused the request as a protocol violation.
    #[error("rejected by peer {ordinal}: {message}")]
    Rejected { ordinal: Ordinal, message: String },

    /// A payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The peer reported an internal failure.
    #[error("peer {ordinal} failed: {message}")]
    Remote { ordinal: Ordinal, message: String },

    #[error("generation listener already registered")]
    ListenerAlreadyRegistered,

    #[error("no generation listener registered")]
    ListenerNotRegistered,

    /// The startup barrier gave up waiting.
    #[error("no peer came up within {waited:?}")]
    NoPeerUp { waited: Duration },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl GossipError {
    /// Returns true for transport failures the caller should retry with
    /// backoff. Conflicts and rejections need a fresh decision instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GossipError::Unreachable { .. }
                | GossipError::Timeout { .. }
                | GossipError::UnknownPeer(_)
                | GossipError::Remote { .. }
        )
    }

    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, GossipError::Conflict { .. })
    }

    #[inline]
    pub fn is_rejected(&self) -> bool {
        matches!(self, GossipError::Rejected { .. })
    }

    /// Map an error body returned by `ordinal` to a transport error.
    pub fn from_body(ordinal: Ordinal, body: ErrorBody) -> Self {
        match body.kind {
            ErrorKind::Conflict => GossipError::Conflict {
                ordinal,
                message: body.message,
            },
            ErrorKind::Rejected | ErrorKind::Malformed => GossipError::Rejected {
                ordinal,
                message: body.message,
            },
            ErrorKind::Unavailable => GossipError::Unreachable {
                ordinal,
                reason: body.message,
            },
            ErrorKind::Internal => GossipError::Remote {
                ordinal,
                message: body.message,
            },
        }
    }

    /// Wrap a generation error raised on the remote node `ordinal`.
    pub fn from_generation(ordinal: Ordinal, err: GenerationError) -> Self {
        Self::from_body(ordinal, ErrorBody::from(&err))
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            GossipError::Unreachable { .. } => "unreachable",
            GossipError::Timeout { .. } => "timeout",
            GossipError::UnknownPeer(_) => "unknown_peer",
            GossipError::Conflict { .. } => "conflict",
            GossipError::Rejected { .. } => "rejected",
            GossipError::Encoding(_) => "encoding",
            GossipError::Remote { .. } => "remote",
            GossipError::ListenerAlreadyRegistered | GossipError::ListenerNotRegistered => {
                "listener"
            }
            GossipError::NoPeerUp { .. } => "no_peer_up",
            GossipError::Bind { .. } => "bind",
        }
    }
}

impl From<serde_json::Error> for GossipError {
    fn from(e: serde_json::Error) -> Self {
        GossipError::Encoding(e.to_string())
    }
}

/// Error class carried in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transaction mismatch. The caller must re-read and decide again.
    Conflict,
    /// Invalid transition for the stored state.
    Rejected,
    /// The request could not be parsed or is missing fields.
    Malformed,
    /// The node cannot serve the request yet.
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Conflict => 409,
            ErrorKind::Rejected | ErrorKind::Malformed => 400,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

/// Structured error body returned by the gossip server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(e: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Malformed, e.to_string())
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, e.to_string())
    }
}

impl From<&GenerationError> for ErrorBody {
    fn from(err: &GenerationError) -> Self {
        let kind = match err {
            GenerationError::Conflict { .. } => ErrorKind::Conflict,
            GenerationError::Rejected {
                reason: RejectReason::Malformed(_),
                ..
            } => ErrorKind::Malformed,
            GenerationError::Rejected { .. } => ErrorKind::Rejected,
        };
        Self::new(kind, err.to_string())
    }
}
