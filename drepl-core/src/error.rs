//! Error taxonomy shared by all replication operations.
//!
//! Every call returns exactly one status in its reply envelope; directory I/O
//! and malformed stored-metadata failures are wrapped as `Internal` at the
//! call boundary with DN/operation context, and authorization failures are
//! returned detail-free.

use serde::{Deserialize, Serialize};

/// Result type for replication operations.
pub type ReplResult<T> = std::result::Result<T, ReplError>;

/// Errors surfaced by the replication engine.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// A request carried a missing or malformed argument.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// The request structure level (or operation) is not supported.
    #[error("unsupported request level {0}")]
    UnknownLevel(u32),

    /// The caller is not authorized. Intentionally detail-free.
    #[error("access denied")]
    AccessDenied,

    /// A referenced object or link does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Directory I/O failure, corrupt stored state, or a broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplError {
    /// Map to the wire status carried in reply envelopes.
    pub fn status(&self) -> WireStatus {
        match self {
            ReplError::Parameter(_) => WireStatus::Parameter,
            ReplError::UnknownLevel(_) => WireStatus::UnknownLevel,
            ReplError::AccessDenied => WireStatus::AccessDenied,
            ReplError::NotFound(_) => WireStatus::NotFound,
            ReplError::Conflict(_) => WireStatus::Conflict,
            ReplError::Internal(_) => WireStatus::Internal,
        }
    }
}

/// Status code carried in every reply envelope.
///
/// `Ok` is terminal success; a paged read signals "more data" through a
/// dedicated reply field, never through the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireStatus {
    Ok,
    Parameter,
    UnknownLevel,
    AccessDenied,
    NotFound,
    Conflict,
    Internal,
}

impl WireStatus {
    /// Whether the status denotes success.
    pub fn is_ok(&self) -> bool {
        matches!(self, WireStatus::Ok)
    }
}

impl std::fmt::Display for WireStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WireStatus::Ok => "ok",
            WireStatus::Parameter => "invalid-parameter",
            WireStatus::UnknownLevel => "unknown-level",
            WireStatus::AccessDenied => "access-denied",
            WireStatus::NotFound => "not-found",
            WireStatus::Conflict => "conflict",
            WireStatus::Internal => "internal-error",
        };
        write!(f, "{}", s)
    }
}
