//! Execution state, progress, and the records a finished run leaves behind.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Completed,
    Aborted,
    Error,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Aborted | ExecutionState::Error
        )
    }

    /// A plan is currently being driven.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ExecutionState::Starting | ExecutionState::Running | ExecutionState::Paused
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "IDLE",
            ExecutionState::Starting => "STARTING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Paused => "PAUSED",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Aborted => "ABORTED",
            ExecutionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One discrete hardware operation within a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Slewing,
    Focusing,
    Imaging,
    /// Not a target phase: session checks and reconnects
    Connection,
}

impl Phase {
    /// Per-target phases, in execution order.
    pub const TARGET_PHASES: [Phase; 3] = [Phase::Slewing, Phase::Focusing, Phase::Imaging];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Slewing => "slewing",
            Phase::Focusing => "focusing",
            Phase::Imaging => "imaging",
            Phase::Connection => "connection",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live view of a run, republished at every phase boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub execution_id: String,
    pub state: ExecutionState,
    pub total_targets: usize,
    pub current_target_index: Option<usize>,
    pub targets_completed: usize,
    pub targets_failed: usize,
    /// Always `(completed + failed) / total * 100`; 0 for an empty plan
    pub progress_percent: f64,
    pub current_phase: Option<Phase>,
}

impl ExecutionProgress {
    pub fn new(execution_id: &str, total_targets: usize) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            total_targets,
            ..Default::default()
        }
    }

    /// Re-derive `progress_percent` from the target counts.
    pub fn recompute(&mut self) {
        self.progress_percent = if self.total_targets == 0 {
            0.0
        } else {
            let done = (self.targets_completed + self.targets_failed) as f64;
            done / self.total_targets as f64 * 100.0
        };
    }
}

/// One failed attempt, as logged. Entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub timestamp: DateTime<Utc>,
    pub target_index: usize,
    pub target_name: String,
    pub phase: Phase,
    pub message: String,
    /// 0 for the first attempt, 1 for the first retry, ...
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetOutcome {
    Completed,
    Failed,
    /// Interrupted by an abort or a lost connection
    Interrupted,
    /// Never started
    Skipped,
}

/// Per-target summary in the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub index: usize,
    pub target_name: String,
    pub outcome: TargetOutcome,
    pub phases_completed: Vec<Phase>,
}

/// Everything a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub state: ExecutionState,
    pub progress: ExecutionProgress,
    pub targets: Vec<TargetResult>,
    pub errors: Vec<ExecutionError>,
    pub parked: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
