use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use surrealdb::sql::Datetime;

use crate::types::{BlobKey, RunId, ScriptId, Tags};

/// Lifecycle state of a run.
///
/// Transitions only move forward: QUEUED -> RUNNING -> {COMPLETED, FAILED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States a run may be in immediately before entering `self`.
    pub fn predecessors(&self) -> &'static [RunStatus] {
        match self {
            Self::Queued => &[],
            Self::Running => &[Self::Queued],
            Self::Completed | Self::Failed => &[Self::Running],
        }
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted representation of a run (table: `run`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Script record the run executes.
    pub script_key: Option<ScriptId>,
    pub status: RunStatus,
    /// Serialized JSON, written when results are reported.
    pub train_config: Option<String>,
    /// Serialized JSON, written when results are reported.
    pub model_config: Option<String>,
    pub train_score: Option<f64>,
    pub validation_score: Option<f64>,
    pub weights_path: Option<BlobKey>,
    /// Comma-joined tag set, see [`Tags`].
    pub tags: Option<String>,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
}

impl RunRecord {
    /// A record as created at submission time: id, status and script only.
    pub fn queued(run_id: RunId, script_key: ScriptId) -> Self {
        Self {
            run_id,
            script_key: Some(script_key),
            status: RunStatus::Queued,
            train_config: None,
            model_config: None,
            train_score: None,
            validation_score: None,
            weights_path: None,
            tags: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn tags(&self) -> Tags {
        self.tags.as_deref().map(Tags::split).unwrap_or_default()
    }
}

impl fmt::Display for RunRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let score = |s: Option<f64>| s.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{} [{}] train_score={} validation_score={} tags={}",
            self.run_id,
            self.status,
            score(self.train_score),
            score(self.validation_score),
            self.tags.as_deref().unwrap_or("-"),
        )
    }
}

/// Persisted representation of an uploaded script (table: `script`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub script_id: ScriptId,
    /// Blob store key of the script body.
    pub script_path: BlobKey,
    /// Original file name, used when the script is downloaded again.
    pub file_name: String,
    /// Hex SHA-256 of the body at upload time.
    pub checksum: Option<String>,
    pub created_at: Option<Datetime>,
}

impl fmt::Display for ScriptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.script_id, self.file_name, self.script_path)
    }
}

/// Results an executed script reports back for its own run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub train_score: Option<f64>,
    pub validation_score: Option<f64>,
    pub weights_path: Option<BlobKey>,
    pub train_config: Option<Value>,
    pub model_config: Option<Value>,
    pub tags: Tags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_backward_and_skipping_transitions_rejected() {
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&RunStatus::Queued).unwrap(), "\"QUEUED\"");
        let parsed: RunStatus = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(parsed, RunStatus::Completed);
        assert_eq!(parsed.to_string(), "COMPLETED");
    }
}
