//! Result aggregation.
//!
//! Host executions record their outcomes concurrently into a
//! [`ResultAggregator`]. Once the run is terminal, [`ResultAggregator::summarize`]
//! hands out a [`RunReport`] ordered by step, then by host resolution order,
//! regardless of completion order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::task::{TaskOutcome, TaskStatus};

/// Run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Only best-effort steps failed
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::PartiallyFailed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::PartiallyFailed => "partially failed",
        };
        f.write_str(s)
    }
}

/// One (host, task, outcome) triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    /// Step index in the plan
    pub step: usize,
    /// Position of the host in the step's resolved host list
    pub host_index: usize,
    pub host: String,
    pub task: String,
    pub outcome: TaskOutcome,
    /// Attempts made, zero when the host never started
    pub attempts: u32,
    pub best_effort: bool,
}

impl ReportEntry {
    fn is_blocking_failure(&self) -> bool {
        self.outcome.is_failure() && !self.best_effort
    }
}

/// Outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub failure: usize,
    pub skipped: usize,
}

/// Immutable, ordered view of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub plan: String,
    /// Machine the run was driven from
    pub controller: String,
    pub status: RunStatus,
    pub cancelled: bool,
    pub entries: Vec<ReportEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// First failure that decided the run's status, in report order
    pub fn first_failure(&self) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|e| e.is_blocking_failure())
            .or_else(|| self.entries.iter().find(|e| e.outcome.is_failure()))
    }

    /// Entries for one task, in host order
    pub fn outcomes_for<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a ReportEntry> + 'a {
        self.entries.iter().filter(move |e| e.task == task)
    }

    /// Whether any entry exists for `task`
    pub fn ran(&self, task: &str) -> bool {
        self.outcomes_for(task).next().is_some()
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for entry in &self.entries {
            match entry.outcome.status {
                TaskStatus::Success => counts.success += 1,
                TaskStatus::Failure => counts.failure += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Process exit code for this report
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded | RunStatus::PartiallyFailed => 0,
            _ => 1,
        }
    }
}

struct AggregatorState {
    status: RunStatus,
    cancelled: bool,
    entries: Vec<ReportEntry>,
    finished_at: Option<DateTime<Utc>>,
}

/// Concurrent, append-only outcome collector
pub struct ResultAggregator {
    run_id: Uuid,
    plan: String,
    started_at: DateTime<Utc>,
    state: Mutex<AggregatorState>,
}

impl ResultAggregator {
    pub fn new(run_id: Uuid, plan: impl Into<String>) -> Self {
        Self {
            run_id,
            plan: plan.into(),
            started_at: Utc::now(),
            state: Mutex::new(AggregatorState {
                status: RunStatus::Pending,
                cancelled: false,
                entries: Vec::new(),
                finished_at: None,
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    /// Move from `Pending` to `Running`
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.status == RunStatus::Pending {
            state.status = RunStatus::Running;
        }
    }

    /// Append an entry. Returns false once the run is terminal.
    pub fn record(&self, entry: ReportEntry) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            tracing::warn!(host = %entry.host, task = %entry.task, "Outcome recorded after run finished; ignored");
            return false;
        }
        state.entries.push(entry);
        true
    }

    /// Reach a terminal state. The status is derived from the entries unless
    /// the run was aborted or cancelled, which always ends `Failed`.
    pub fn finish(&self, aborted: bool, cancelled: bool) -> RunStatus {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return state.status;
        }
        let blocking = state.entries.iter().any(ReportEntry::is_blocking_failure);
        let any_failure = state.entries.iter().any(|e| e.outcome.is_failure());
        state.status = if aborted || cancelled || blocking {
            RunStatus::Failed
        } else if any_failure {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        };
        state.cancelled = cancelled;
        state.finished_at = Some(Utc::now());
        state.status
    }

    /// Ordered report; only available once the run is terminal
    pub fn summarize(&self) -> Result<RunReport> {
        let state = self.state.lock();
        if !state.status.is_terminal() {
            return Err(Error::ReportNotReady);
        }
        let mut entries = state.entries.clone();
        entries.sort_by_key(|e| (e.step, e.host_index));

        Ok(RunReport {
            run_id: self.run_id,
            plan: self.plan.clone(),
            controller: controller_name(),
            status: state.status,
            cancelled: state.cancelled,
            entries,
            started_at: self.started_at,
            finished_at: state.finished_at.unwrap_or_else(Utc::now),
        })
    }
}

fn controller_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
