use ulid::Ulid;

use crate::model::{Day, ReservationStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Malformed or out-of-policy input.
    Validation(String),
    /// The range overlaps an active reservation or lock with this id.
    Conflict(Ulid),
    Unauthorized(String),
    IllegalTransition {
        op: &'static str,
        status: ReservationStatus,
    },
    /// Approve/deny with no proposal staged.
    NothingStaged(&'static str),
    NotYetEnded(Day),
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse classification so callers can tell bad input from bad timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Authorization,
    State,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::Validation(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Unauthorized(_) => ErrorKind::Authorization,
            EngineError::IllegalTransition { .. }
            | EngineError::NothingStaged(_)
            | EngineError::NotYetEnded(_) => ErrorKind::State,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_state(&self) -> bool {
        self.kind() == ErrorKind::State
    }

    pub fn is_authorization(&self) -> bool {
        self.kind() == ErrorKind::Authorization
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Authorization => "unauthorized",
            ErrorKind::State => "illegal_transition",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(reason) => write!(f, "invalid request: {reason}"),
            EngineError::Conflict(id) => write!(f, "dates unavailable: overlaps {id}"),
            EngineError::Unauthorized(reason) => write!(f, "not permitted: {reason}"),
            EngineError::IllegalTransition { op, status } => {
                write!(f, "cannot {op} a reservation in status {status}")
            }
            EngineError::NothingStaged(op) => write!(f, "cannot {op}: no change is pending"),
            EngineError::NotYetEnded(end) => {
                write!(f, "reservation has not ended yet (ends {end})")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_are_distinct_from_validation() {
        let illegal = EngineError::IllegalTransition {
            op: "complete",
            status: ReservationStatus::Pending,
        };
        assert!(illegal.is_state());
        assert!(!illegal.is_validation());
        assert!(EngineError::NothingStaged("approve change").is_state());
        assert!(EngineError::Validation("bad".into()).is_validation());
        assert!(EngineError::LimitExceeded("note too long").is_validation());
    }

    #[test]
    fn display_names_the_operation() {
        let err = EngineError::IllegalTransition {
            op: "cancel",
            status: ReservationStatus::Completed,
        };
        assert_eq!(err.to_string(), "cannot cancel a reservation in status COMPLETED");
        assert_eq!(EngineError::Conflict(Ulid::nil()).label(), "conflict");
    }
}
