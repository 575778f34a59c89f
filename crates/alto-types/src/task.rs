//! Task identity, lifecycle, and persisted records.

use serde::{Deserialize, Serialize};

/// Task identifier of the form `<kind>:<arg>` (e.g. `catalog:tap-x`,
/// `tap-x:target-jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build an id from its kind and argument halves.
    #[must_use]
    pub fn new(kind: impl AsRef<str>, arg: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", kind.as_ref(), arg.as_ref()))
    }

    /// Parse an id the user typed; accepts bare kinds (`build`) too.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self(raw.to_string())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind half (`catalog` of `catalog:tap-x`), or the whole id when
    /// no colon is present.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(k, _)| k)
    }

    /// The argument half, when present.
    #[must_use]
    pub fn arg(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, a)| a)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task lifecycle; all non-`Pending`/`Running` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Wire-format string for display and storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether the task has reached a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted per-task entry in the project-root record file.
///
/// A task is up-to-date iff `inputs_fingerprint` matches the currently
/// computed fingerprint and every path in `outputs` exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// 40-hex digest over the task's declared inputs.
    pub inputs_fingerprint: String,
    /// Declared output files, relative to the project root or absolute.
    #[serde(default)]
    pub outputs: Vec<String>,
    pub status: TaskStatus,
    /// UTC timestamp of the last execution, RFC 3339.
    pub last_run_ts: String,
}

impl TaskRecord {
    /// Record a successful run finishing now.
    #[must_use]
    pub fn succeeded(task_id: TaskId, inputs_fingerprint: String, outputs: Vec<String>) -> Self {
        Self::finished(task_id, inputs_fingerprint, outputs, TaskStatus::Succeeded)
    }

    /// Record a failed run finishing now.
    #[must_use]
    pub fn failed(task_id: TaskId, inputs_fingerprint: String) -> Self {
        Self::finished(task_id, inputs_fingerprint, Vec::new(), TaskStatus::Failed)
    }

    fn finished(
        task_id: TaskId,
        inputs_fingerprint: String,
        outputs: Vec<String>,
        status: TaskStatus,
    ) -> Self {
        Self {
            task_id,
            inputs_fingerprint,
            outputs,
            status,
            last_run_ts: chrono::Utc::now().to_rfc3339(),
        }
    }
}
