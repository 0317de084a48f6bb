//! Run report: one fixed-width row for the workflow, one per processor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ProcessorStatus;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Counters a processor keeps about its own run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub status: ProcessorStatus,
    /// Jobs entered into the stack.
    pub started: u64,
    /// Results that left the stack.
    pub completed: u64,
    /// Results carrying error values, plus unabsorbed failures.
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ProcessorStats {
    fn default() -> Self {
        Self {
            status: ProcessorStatus::Pending,
            started: 0,
            completed: 0,
            errors: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub name: String,
    pub status: String,
    pub queued: u64,
    pub started: u64,
    pub completed: u64,
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReportRow {
    /// `queued` and `started` count iterations, which the processor's own
    /// stats cannot see when its stack fans out.
    pub fn for_processor(name: &str, stats: &ProcessorStats, queued: u64, started: u64) -> Self {
        Self {
            name: name.to_string(),
            status: stats.status.to_string(),
            queued,
            started,
            completed: stats.completed,
            errors: stats.errors,
            started_at: stats.started_at,
            finished_at: stats.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow: ReportRow,
    pub processors: Vec<ReportRow>,
}

impl RunReport {
    /// Workflow row totals are the sums of the processor rows.
    pub fn new(
        name: &str,
        status: impl fmt::Display,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        processors: Vec<ReportRow>,
    ) -> Self {
        let sum = |f: fn(&ReportRow) -> u64| -> u64 { processors.iter().map(f).sum() };
        let workflow = ReportRow {
            name: name.to_string(),
            status: status.to_string(),
            queued: sum(|r| r.queued),
            started: sum(|r| r.started),
            completed: sum(|r| r.completed),
            errors: sum(|r| r.errors),
            started_at,
            finished_at,
        };
        Self {
            workflow,
            processors,
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &ReportRow> {
        std::iter::once(&self.workflow).chain(&self.processors)
    }
}

fn time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.rows().map(|r| r.name.len()).max().unwrap_or(0).max(4);
        writeln!(
            f,
            "{:<width$}  {:<11} {:>7} {:>8} {:>9} {:>7}  {:<19}  {:<19}",
            "Name", "Status", "Queued", "Started", "Complete", "Errors", "Started-time", "Finished-time",
        )?;
        for row in self.rows() {
            writeln!(
                f,
                "{:<width$}  {:<11} {:>7} {:>8} {:>9} {:>7}  {:<19}  {:<19}",
                row.name,
                row.status,
                row.queued,
                row.started,
                row.completed,
                row.errors,
                time(row.started_at),
                time(row.finished_at),
            )?;
        }
        Ok(())
    }
}
