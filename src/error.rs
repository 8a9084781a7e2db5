//! Crate-level error type and process exit codes.

use crate::config::ConfigError;
use crate::integrator::IntegrationError;
use crate::ledger::LedgerError;
use crate::oracle::ProposalError;
use crate::reflection::InvalidTransition;
use crate::self_modify::SelfModError;
use crate::store::StoreError;
use crate::tasks::TaskFileError;
use crate::tracker::TrackerError;

/// Exit code: everything went through.
pub const EXIT_OK: i32 = 0;
/// Exit code: a proposal or sandbox failure occurred; persistent state is valid.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code: the generation log is corrupted; nothing was committed.
pub const EXIT_CORRUPTED: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum EvoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tasks(#[from] TaskFileError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(transparent)]
    SelfModify(#[from] SelfModError),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Reflection(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvoError {
    pub fn is_corrupted_log(&self) -> bool {
        match self {
            EvoError::Ledger(e) => e.is_corrupted(),
            EvoError::Tracker(e) => e.is_corrupted_log(),
            EvoError::Integration(IntegrationError::Tracker(e)) => e.is_corrupted_log(),
            EvoError::SelfModify(SelfModError::Integration(IntegrationError::Tracker(e))) => e.is_corrupted_log(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_corrupted_log() {
            EXIT_CORRUPTED
        } else {
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupted_log_exits_two() {
        let err = EvoError::from(LedgerError::Corrupted { line: 3, offset: 120, reason: "index gap".into() });
        assert!(err.is_corrupted_log());
        assert_eq!(err.exit_code(), EXIT_CORRUPTED);

        let nested = EvoError::from(TrackerError::Ledger(LedgerError::Corrupted {
            line: 1,
            offset: 0,
            reason: "bad json".into(),
        }));
        assert_eq!(nested.exit_code(), EXIT_CORRUPTED);
    }

    #[test]
    fn test_other_errors_exit_one() {
        let err = EvoError::from(ProposalError::Empty);
        assert!(!err.is_corrupted_log());
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }
}
