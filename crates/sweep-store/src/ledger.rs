use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use sweep_core::{atomic_write_bytes, ensure_dir, Configuration, Outcome};

use crate::StoreError;

pub type TrialId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Failed,
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Pruned => "pruned",
            TrialState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn schema_version_default() -> String {
    "trial_v1".to_string()
}

/// One persisted trial record. Created in `Running` state when a worker
/// claims a slot, transitioned exactly once to a terminal state, never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    #[serde(default = "schema_version_default")]
    pub schema_version: String,
    pub id: TrialId,
    pub configuration: Configuration,
    pub state: TrialState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The shared persisted trial collection, reachable by all worker processes
/// of a study. Individual trial transitions are atomic; cross-trial
/// check-then-act isolation is the dedup guard's job, not the ledger's.
pub trait TrialLedger: Send + Sync {
    /// Allocate a monotonic id and persist a `Running` trial for
    /// `configuration`.
    fn create_trial(&self, configuration: &Configuration) -> Result<TrialId, StoreError>;

    /// Transition a `Running` trial to the terminal state implied by
    /// `outcome`. Completing an already-terminal trial is an error.
    fn complete_trial(&self, id: TrialId, outcome: &Outcome) -> Result<(), StoreError>;

    /// A consistent snapshot of every trial, ordered by id.
    fn all_trials(&self) -> Result<Vec<Trial>, StoreError>;

    /// The minimum-objective configuration across all `Complete` trials.
    fn best_objective(&self) -> Result<Option<(Configuration, u64)>, StoreError>;
}

/// File-backed ledger: one JSON document per trial under
/// `<study_dir>/trials/`. Id allocation relies on exclusive file creation,
/// so it stays race-free across independent OS processes; terminal
/// transitions go through an atomic rename.
#[derive(Debug, Clone)]
pub struct FileLedger {
    trials_dir: PathBuf,
}

impl FileLedger {
    pub fn open(study_dir: &Path) -> Result<Self, StoreError> {
        let trials_dir = study_dir.join("trials");
        ensure_dir(&trials_dir)?;
        Ok(Self { trials_dir })
    }

    fn trial_path(&self, id: TrialId) -> PathBuf {
        self.trials_dir.join(format!("trial_{:06}.json", id))
    }

    fn id_from_file_name(name: &str) -> Option<TrialId> {
        name.strip_prefix("trial_")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    fn next_candidate_id(&self) -> Result<TrialId, StoreError> {
        let mut max_id = 0;
        for entry in fs::read_dir(&self.trials_dir)? {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(Self::id_from_file_name)
            {
                max_id = max_id.max(id);
            }
        }
        Ok(max_id + 1)
    }

    /// `Ok(None)` means the file is a zero-length id reservation whose
    /// record has not landed yet; snapshot readers skip it.
    fn load_trial(path: &Path) -> Result<Option<Trial>, StoreError> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice(&bytes) {
            Ok(trial) => Ok(Some(trial)),
            Err(e) => Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }
}

impl TrialLedger for FileLedger {
    fn create_trial(&self, configuration: &Configuration) -> Result<TrialId, StoreError> {
        let mut id = self.next_candidate_id()?;
        loop {
            let path = self.trial_path(id);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_reservation) => {
                    let trial = Trial {
                        schema_version: schema_version_default(),
                        id,
                        configuration: configuration.clone(),
                        state: TrialState::Running,
                        value: None,
                        prune_reason: None,
                        exit_code: None,
                        created_at: Utc::now(),
                        completed_at: None,
                    };
                    let bytes = serde_json::to_vec_pretty(&trial)?;
                    atomic_write_bytes(&path, &bytes)?;
                    return Ok(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    id += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn complete_trial(&self, id: TrialId, outcome: &Outcome) -> Result<(), StoreError> {
        let path = self.trial_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound { id });
        }
        let mut trial = Self::load_trial(&path)?.ok_or(StoreError::NotFound { id })?;
        if trial.state != TrialState::Running {
            return Err(StoreError::AlreadyTerminal {
                id,
                state: trial.state.to_string(),
            });
        }
        match outcome {
            Outcome::Objective { value } => {
                trial.state = TrialState::Complete;
                trial.value = Some(*value);
            }
            Outcome::Pruned { reason } => {
                trial.state = TrialState::Pruned;
                trial.prune_reason = Some(reason.clone());
            }
            Outcome::Failed { exit_code } => {
                trial.state = TrialState::Failed;
                trial.exit_code = Some(*exit_code);
            }
            Outcome::Duplicate => {
                trial.state = TrialState::Pruned;
                trial.prune_reason = Some("duplicate configuration".to_string());
            }
        }
        trial.completed_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&trial)?;
        atomic_write_bytes(&path, &bytes)?;
        Ok(())
    }

    fn all_trials(&self) -> Result<Vec<Trial>, StoreError> {
        let mut trials = Vec::new();
        for entry in fs::read_dir(&self.trials_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if Self::id_from_file_name(name).is_none() {
                continue;
            }
            if let Some(trial) = Self::load_trial(&entry.path())? {
                trials.push(trial);
            }
        }
        trials.sort_by_key(|t| t.id);
        Ok(trials)
    }

    fn best_objective(&self) -> Result<Option<(Configuration, u64)>, StoreError> {
        let best = self
            .all_trials()?
            .into_iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter_map(|t| t.value.map(|v| (t.configuration, v)))
            .min_by_key(|(_, v)| *v);
        Ok(best)
    }
}
