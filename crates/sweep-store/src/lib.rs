pub mod ledger;
pub mod lock;

use std::path::PathBuf;
use thiserror::Error;

pub use ledger::{FileLedger, Trial, TrialId, TrialLedger, TrialState};
pub use lock::StudyLock;

/// Errors from the ledger and lock collaborators. All of these are fatal to
/// the whole run when they reach the scheduler; per-trial conditions travel
/// as `Outcome` values instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger_io: {0}")]
    Io(#[from] std::io::Error),

    #[error("trial_record_encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("trial_record_corrupt: {}: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("trial_not_found: trial_{id}")]
    NotFound { id: ledger::TrialId },

    #[error("trial_already_terminal: trial_{id} is {state}")]
    AlreadyTerminal { id: ledger::TrialId, state: String },

    #[error("lock_wait_exceeded: {} not released within {waited_secs}s", .path.display())]
    LockTimeout { path: PathBuf, waited_secs: u64 },
}
