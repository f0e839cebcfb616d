use std::fmt;

use thiserror::Error;

use crate::config::Network;
use crate::ledger::{AccountId, LedgerError};
use crate::registry::{MilestoneIndex, ScholarshipId, ScholarshipState};

/// What an operation was acting on when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// A creation request that has no id yet.
    Request,
    Scholarship(ScholarshipId),
    Milestone(ScholarshipId, MilestoneIndex),
}

impl Target {
    pub fn scholarship_id(&self) -> Option<ScholarshipId> {
        match self {
            Target::Request => None,
            Target::Scholarship(id) | Target::Milestone(id, _) => Some(*id),
        }
    }

    pub fn milestone(&self) -> Option<MilestoneIndex> {
        match self {
            Target::Milestone(_, index) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Request => f.write_str("new scholarship"),
            Target::Scholarship(id) => write!(f, "scholarship {id}"),
            Target::Milestone(id, index) => write!(f, "scholarship {id} milestone {index}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller or business-rule error. Never retried.
    Validation,
    /// Lost a compare-and-set race. Re-read, then decide.
    Conflict,
    /// Ledger timeout or refused transfer. Retry with backoff.
    Transient,
    /// No further progress is possible for the target.
    Fatal,
}

/// Every failure the escrow engine reports.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("invalid allocation: {reason}")]
    InvalidAllocation { reason: String },

    #[error("invalid milestone count {count}{}", .max.map(|m| format!(" (maximum {m})")).unwrap_or_default())]
    InvalidMilestoneCount { count: usize, max: Option<usize> },

    #[error("address {address:?} is not valid on {network}")]
    InvalidAddress { address: AccountId, network: Network },

    #[error("{actor} may not {action} {target}")]
    Unauthorized {
        target: Target,
        actor: AccountId,
        action: &'static str,
    },

    #[error("cannot {action} {target} while {found}")]
    InvalidState {
        target: Target,
        action: &'static str,
        found: String,
    },

    #[error("{target} not found")]
    NotFound { target: Target },

    /// `prior` is the scholarship state the caller read before losing the race.
    #[error("{target} changed concurrently{}: {detail}", .prior.map(|s| format!(" (read while {s})")).unwrap_or_default())]
    StateConflict {
        target: Target,
        prior: Option<ScholarshipState>,
        detail: String,
    },

    #[error("request key {key:?} of {donor} already opened scholarship {existing} with different terms")]
    DuplicateRequest {
        donor: AccountId,
        key: String,
        existing: ScholarshipId,
    },

    #[error("invalid request key {key:?}: {reason}")]
    InvalidRequestKey { key: String, reason: &'static str },

    #[error("ledger unavailable while processing {target}: {reason}")]
    PrimitiveUnavailable { target: Target, reason: String },

    #[error("transfer for {target} failed: {reason}")]
    TransferFailed { target: Target, reason: String },

    #[error("{target} rejected {rejections} times (limit {limit}); remaining escrow recovered")]
    RetryLimitExceeded {
        target: Target,
        rejections: u32,
        limit: u32,
    },

    #[error("stored record for {target} is malformed: {reason}")]
    CorruptRecord { target: Target, reason: String },
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::InvalidAllocation { .. }
            | EscrowError::InvalidMilestoneCount { .. }
            | EscrowError::InvalidAddress { .. }
            | EscrowError::InvalidRequestKey { .. }
            | EscrowError::DuplicateRequest { .. }
            | EscrowError::Unauthorized { .. }
            | EscrowError::InvalidState { .. }
            | EscrowError::NotFound { .. } => ErrorKind::Validation,
            EscrowError::StateConflict { .. } => ErrorKind::Conflict,
            EscrowError::PrimitiveUnavailable { .. } | EscrowError::TransferFailed { .. } => {
                ErrorKind::Transient
            }
            EscrowError::RetryLimitExceeded { .. } | EscrowError::CorruptRecord { .. } => {
                ErrorKind::Fatal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transient)
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            EscrowError::InvalidAllocation { .. }
            | EscrowError::InvalidMilestoneCount { .. }
            | EscrowError::InvalidAddress { .. }
            | EscrowError::InvalidRequestKey { .. } => None,
            EscrowError::DuplicateRequest { existing, .. } => Some(Target::Scholarship(*existing)),
            EscrowError::Unauthorized { target, .. }
            | EscrowError::InvalidState { target, .. }
            | EscrowError::NotFound { target }
            | EscrowError::StateConflict { target, .. }
            | EscrowError::PrimitiveUnavailable { target, .. }
            | EscrowError::TransferFailed { target, .. }
            | EscrowError::RetryLimitExceeded { target, .. }
            | EscrowError::CorruptRecord { target, .. } => Some(*target),
        }
    }

    /// Records the scholarship state a losing writer had read.
    pub(crate) fn with_prior(self, state: ScholarshipState) -> Self {
        match self {
            EscrowError::StateConflict { target, detail, .. } => EscrowError::StateConflict {
                target,
                prior: Some(state),
                detail,
            },
            other => other,
        }
    }

    /// Attaches `target` to a ledger failure.
    pub(crate) fn from_ledger(target: Target, err: LedgerError) -> Self {
        match err {
            LedgerError::VersionMismatch { .. } | LedgerError::DuplicateTransaction { .. } => {
                EscrowError::StateConflict {
                    target,
                    prior: None,
                    detail: err.to_string(),
                }
            }
            LedgerError::Unavailable { reason } => EscrowError::PrimitiveUnavailable { target, reason },
            LedgerError::CorruptSnapshot => EscrowError::CorruptRecord {
                target,
                reason: err.to_string(),
            },
            LedgerError::InsufficientAccountFunds { .. }
            | LedgerError::InsufficientEscrowFunds { .. }
            | LedgerError::UnknownAccount { .. }
            | LedgerError::UnknownEscrow { .. }
            | LedgerError::TransferRejected { .. }
            | LedgerError::Overflow => EscrowError::TransferFailed {
                target,
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Version;

    #[test]
    fn classifies_retryable_errors() {
        let conflict = EscrowError::from_ledger(
            Target::Milestone(4, 1),
            LedgerError::VersionMismatch {
                key: "scholarship/4".into(),
                expected: Version(2),
                found: Version(3),
            },
        );
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_retryable());
        assert_eq!(conflict.target(), Some(Target::Milestone(4, 1)));
        let conflict = conflict.with_prior(ScholarshipState::Active);
        assert!(matches!(
            conflict,
            EscrowError::StateConflict { prior: Some(ScholarshipState::Active), .. }
        ));
        assert!(conflict.to_string().starts_with("scholarship 4 milestone 1 changed concurrently (read while active): "));

        let timeout = EscrowError::from_ledger(
            Target::Scholarship(4),
            LedgerError::Unavailable {
                reason: "timeout".into(),
            },
        );
        assert!(matches!(timeout, EscrowError::PrimitiveUnavailable { .. }));
        assert!(timeout.is_retryable());

        let unauthorized = EscrowError::Unauthorized {
            target: Target::Scholarship(4),
            actor: "eve".into(),
            action: "cancel",
        };
        assert_eq!(unauthorized.kind(), ErrorKind::Validation);
        assert!(!unauthorized.is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let err = EscrowError::InvalidState {
            target: Target::Milestone(9, 2),
            action: "release",
            found: "claimed".into(),
        };
        assert_eq!(err.to_string(), "cannot release scholarship 9 milestone 2 while claimed");
        let err = EscrowError::InvalidMilestoneCount { count: 40, max: Some(20) };
        assert_eq!(err.to_string(), "invalid milestone count 40 (maximum 20)");
        let err = EscrowError::InvalidMilestoneCount { count: 0, max: None };
        assert_eq!(err.to_string(), "invalid milestone count 0");
    }
}
