use thiserror::Error;
use ulid::Ulid;

/// Why a request was refused before anything was written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("reservation cannot start in the past")]
    StartInPast,
    #[error("reservation cannot end in the past")]
    EndInPast,
    #[error("reservation must end after it starts")]
    EndNotAfterStart,
    #[error("reservation lasts {minutes} min, minimum is 15")]
    TooShort { minutes: i64 },
    #[error("reservation lasts {minutes} min, maximum is 120")]
    TooLong { minutes: i64 },
    #[error("room capacity must be greater than zero")]
    InvalidCapacity,
    #[error("room name must not be empty")]
    EmptyName,
    #[error("reservation user must not be empty")]
    EmptyUser,
    #[error("occupied is derived from reservations and cannot be set directly")]
    ForcedOccupied,
    #[error("an inactive reservation cannot be reactivated")]
    Reactivation,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("overlaps active reservation: {0}")]
    Overlap(Ulid),
    #[error("room name already in use: {0}")]
    DuplicateName(String),
    #[error("reservation {0} is inactive")]
    Inactive(Ulid),
    #[error("reservation {0} is in progress and cannot be deleted")]
    InProgress(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Validation(_) => "validation",
            EngineError::Overlap(_) => "overlap",
            EngineError::DuplicateName(_) => "duplicate_name",
            EngineError::Inactive(_) => "inactive",
            EngineError::InProgress(_) => "in_progress",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "wal",
        }
    }
}
