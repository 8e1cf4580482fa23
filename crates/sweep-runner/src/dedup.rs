use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use sweep_core::{Configuration, Outcome, ParamDomains};
use sweep_store::{StoreError, StudyLock, Trial, TrialLedger, TrialState};

use crate::suggest::{SuggestError, Suggester};

/// Result of one claim attempt. A duplicate is an immediate prune of the
/// slot, not a retry; fresh candidates only arrive with fresh slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Claimed {
        trial_id: sweep_store::TrialId,
        configuration: Configuration,
    },
    Duplicate {
        configuration: Configuration,
    },
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Suggest(#[from] SuggestError),
}

/// Serializes the suggest-check-register sequence across every worker
/// process of a study.
///
/// Holding the lock around the ledger read alone would let two workers pass
/// the duplicate check for the same candidate before either registered a
/// trial, so the whole sequence is the critical section. The Running trial
/// written before release is the duplicate marker for later claimants.
pub struct DedupGuard<'a> {
    ledger: &'a dyn TrialLedger,
    lock_path: PathBuf,
    lock_wait: Duration,
    stale_running: Option<Duration>,
}

impl<'a> DedupGuard<'a> {
    pub fn new(
        ledger: &'a dyn TrialLedger,
        lock_path: PathBuf,
        lock_wait: Duration,
        stale_running: Option<Duration>,
    ) -> Self {
        Self {
            ledger,
            lock_path,
            lock_wait,
            stale_running,
        }
    }

    pub fn claim_unique(
        &self,
        suggester: &dyn Suggester,
        domains: &ParamDomains,
    ) -> Result<Claim, ClaimError> {
        let _lock = StudyLock::acquire(&self.lock_path, self.lock_wait)?;
        let configuration = suggester.suggest(domains)?;
        let now = Utc::now();
        let blocked = self
            .ledger
            .all_trials()?
            .into_iter()
            .any(|trial| trial.configuration == configuration && self.blocks(&trial, now));
        if blocked {
            let trial_id = self.ledger.create_trial(&configuration)?;
            self.ledger.complete_trial(trial_id, &Outcome::Duplicate)?;
            tracing::debug!(trial = trial_id, %configuration, "rejected duplicate candidate");
            return Ok(Claim::Duplicate { configuration });
        }
        let trial_id = self.ledger.create_trial(&configuration)?;
        Ok(Claim::Claimed {
            trial_id,
            configuration,
        })
    }

    /// Complete trials block their configuration forever; Running trials
    /// block only while younger than the staleness threshold, so a crashed
    /// worker does not poison its configuration permanently.
    fn blocks(&self, trial: &Trial, now: DateTime<Utc>) -> bool {
        match trial.state {
            TrialState::Complete => true,
            TrialState::Running => !self.is_stale(trial, now),
            TrialState::Pruned | TrialState::Failed => false,
        }
    }

    fn is_stale(&self, trial: &Trial, now: DateTime<Utc>) -> bool {
        let Some(threshold) = self.stale_running else {
            return false;
        };
        (now - trial.created_at)
            .to_std()
            .map_or(false, |age| age > threshold)
    }
}
