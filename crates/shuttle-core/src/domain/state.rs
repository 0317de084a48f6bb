//! State machines for child jobs, processors and runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one child job inside a Parallelize layer.
///
/// Transitions:
/// - Queued -> Sent -> Completed
/// - Queued -> Sent -> Failed
/// - Queued -> (discarded on cancel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Sent,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Lifecycle of a workflow run.
///
/// - NotStarted -> Running (fire / first push)
/// - Running <-> Paused
/// - Running | Paused -> Completed | Cancelled | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }

    pub fn is_started(self) -> bool {
        !matches!(self, RunState::NotStarted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::NotStarted => "Not started",
            RunState::Running => "Running",
            RunState::Paused => "Paused",
            RunState::Completed => "Complete",
            RunState::Cancelled => "Cancelled",
            RunState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Per-processor status shown in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorStatus::Pending => "Pending",
            ProcessorStatus::Running => "Running",
            ProcessorStatus::Completed => "Complete",
            ProcessorStatus::Cancelled => "Cancelled",
            ProcessorStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}
