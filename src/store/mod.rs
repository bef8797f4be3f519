//! Persistence port.
//!
//! The pipeline only talks to storage through `PilotStore`. Two adapters ship
//! with the crate: `MemoryStore` for tests and ephemeral use, and
//! `SqliteStore` for durable state. Both serialise the credit commit per
//! store, so a pilot's balance can never be spent twice.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::schema::{Pilot, RunLog};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("could not encode or decode stored json: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
    #[error("pilot {0} does not exist")]
    UnknownPilot(String),
    #[error("store lock was poisoned")]
    Poisoned,
}

/// Terminal states of a credit commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Success { credits_left: i64 },
    NotFound,
    InsufficientCredits,
}

impl CommitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NotFound => "not_found",
            Self::InsufficientCredits => "insufficient_credits",
        }
    }
}

pub trait PilotStore: Send + Sync {
    fn create_pilot(&self, pilot: &Pilot) -> Result<(), StoreError>;

    fn get_pilot(&self, id: &str) -> Result<Option<Pilot>, StoreError>;

    /// Replaces the editable parts of a stored pilot and bumps its version by
    /// one in the same critical section. Credits, id and creation time are kept
    /// from the stored row; the caller's `version` is ignored. Returns the
    /// stored row, or `None` for an unknown id.
    fn update_pilot(&self, pilot: &Pilot) -> Result<Option<Pilot>, StoreError>;

    /// Newest first.
    fn list_pilots(&self) -> Result<Vec<Pilot>, StoreError>;

    /// Appends without touching credits. Keeps at most `RUN_LOG_LIMIT` logs
    /// per pilot. Fails with `UnknownPilot` when the owner does not exist.
    fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError>;

    /// Newest first, at most `limit` entries.
    fn list_run_logs(&self, pilot_id: &str, limit: usize) -> Result<Vec<RunLog>, StoreError>;

    /// Atomically spends one credit and appends `log`. Nothing is mutated
    /// unless the outcome is `Success`.
    fn commit_run(&self, pilot_id: &str, log: &RunLog) -> Result<CommitOutcome, StoreError>;

    fn delete_run_logs_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    fn get_meta(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set_meta(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Compare-and-set on a metadata row: writes `value` only if the current
    /// value equals `expected` (`None` meaning absent). Returns whether the
    /// write happened.
    fn claim_meta(
        &self,
        key: &str,
        expected: Option<&Value>,
        value: &Value,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::schema::{
        InputField, Pilot, RecordMode, RecordPayload, RunLog, RunStatus, StepTool, StepType,
        WorkflowStep,
    };
    use std::collections::BTreeMap;

    pub fn pilot(id: &str, credits: i64, created_at_ms: i64) -> Pilot {
        Pilot {
            id: id.to_string(),
            name: format!("Pilot {id}"),
            one_liner: "Summarize the pasted text".to_string(),
            record_mode: RecordMode::Describe,
            record: RecordPayload {
                description: Some("Summarize the pasted text".to_string()),
                ..RecordPayload::default()
            },
            inputs: vec![InputField {
                key: "source_text".to_string(),
                label: "Source text".to_string(),
                required: true,
                placeholder: None,
            }],
            steps: vec![
                WorkflowStep {
                    id: "step_1".to_string(),
                    order: 1,
                    step_type: StepType::Condition,
                    title: "Review".to_string(),
                    description: String::new(),
                    tool: StepTool::Simulated,
                    requires_approval: true,
                    prompt_template: None,
                },
                WorkflowStep {
                    id: "step_2".to_string(),
                    order: 2,
                    step_type: StepType::Output,
                    title: "Write".to_string(),
                    description: String::new(),
                    tool: StepTool::Generation,
                    requires_approval: false,
                    prompt_template: Some("Summarize {{source_text}}".to_string()),
                },
            ],
            credits,
            version: 1,
            created_at_ms,
        }
    }

    pub fn run_log(id: &str, pilot_id: &str, created_at_ms: i64) -> RunLog {
        let mut values = BTreeMap::new();
        values.insert("source_text".to_string(), "hello".to_string());
        RunLog {
            id: id.to_string(),
            pilot_id: pilot_id.to_string(),
            created_at_ms,
            input_values: values,
            output_preview: format!("output {id}"),
            total_tokens: Some(12),
            status: RunStatus::Success,
        }
    }
}
