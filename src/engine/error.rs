use thiserror::Error;
use ulid::Ulid;

use crate::model::SessionState;
use crate::repository::RepositoryError;
use crate::timezone::CodecError;

/// Date validation failures found before anything reaches the network.
/// Checked in declaration order; only the first is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid start date")]
    InvalidStart,
    #[error("invalid end date")]
    InvalidEnd,
    #[error("end date is before start date")]
    InvalidRange,
}

impl ValidationError {
    /// Stable code for the UI to map onto the failing field.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidStart => "INVALID_START",
            ValidationError::InvalidEnd => "INVALID_END",
            ValidationError::InvalidRange => "INVALID_RANGE",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
    #[error("session {0} is not planifiable")]
    NotPlanifiable(Ulid),
    #[error("save already in progress for session {0}")]
    SaveInProgress(Ulid),
    #[error("no pending save for session {0}")]
    NoPendingSave(Ulid),
    #[error("unknown session: {0}")]
    UnknownSession(Ulid),
    #[error("stale sibling snapshot: have version {current}, got {received}")]
    StaleSnapshot { current: u64, received: u64 },
}

impl EngineError {
    /// Errors that keep the editing session open and dirty with no retry.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::NotPlanifiable(_))
    }
}
