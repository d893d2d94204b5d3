use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::model::AppointmentStatus;

use super::availability::RuleValidation;

/// Why a booking or promotion was turned down. These are expected outcomes,
/// not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    SlotTaken,
    MaxDailyReached,
    QuotaExceeded,
    SubjectMismatch,
    SlotUnavailable,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::SlotTaken => "slot_taken",
            RejectReason::MaxDailyReached => "max_daily_reached",
            RejectReason::QuotaExceeded => "quota_exceeded",
            RejectReason::SubjectMismatch => "subject_mismatch",
            RejectReason::SlotUnavailable => "slot_unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time: {0}")]
    InvalidTime(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("booking rejected: {0}")]
    Rejected(RejectReason),
    #[error("availability rule has {} blocking conflict(s)", .0.conflicts.len())]
    RuleConflict(Box<RuleValidation>),
    #[error("cannot move appointment from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("forbidden")]
    Forbidden,
    #[error("unknown subject: {0}")]
    UnknownSubject(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable snake_case identifier, safe to surface to callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidTime(_) => "invalid_time",
            EngineError::Validation(_) => "validation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Rejected(reason) => reason.code(),
            EngineError::RuleConflict(_) => "rule_conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Forbidden => "forbidden",
            EngineError::UnknownSubject(_) => "unknown_subject",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Storage(_) => "storage",
        }
    }

    /// Only storage failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }
}

impl From<RejectReason> for EngineError {
    fn from(reason: RejectReason) -> Self {
        EngineError::Rejected(reason)
    }
}

impl From<CalendarError> for EngineError {
    fn from(err: CalendarError) -> Self {
        EngineError::InvalidTime(err.to_string())
    }
}
