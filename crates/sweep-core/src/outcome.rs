use serde::{Deserialize, Serialize};

/// Terminal classification of one trial slot.
///
/// Every stage returns an `Outcome` by value; "skip this trial" is never
/// signalled by an error. Pruned trials are excluded from objective
/// comparison but are not hard failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Successful run with the aggregate cycle count (lower is better).
    Objective { value: u64 },
    /// Deliberately excluded: timeout, validation mismatch, zero aggregate.
    Pruned { reason: String },
    /// The process exited non-zero or could not report an exit code.
    Failed { exit_code: i32 },
    /// Rejected by the dedup guard before any invocation.
    Duplicate,
}

impl Outcome {
    pub fn pruned(reason: impl Into<String>) -> Self {
        Outcome::Pruned {
            reason: reason.into(),
        }
    }

    pub fn objective(&self) -> Option<u64> {
        match self {
            Outcome::Objective { value } => Some(*value),
            _ => None,
        }
    }
}
