//! Structured run events.
//!
//! The runner reports progress as [`RunEvent`]s delivered to an
//! [`EventSink`]. Sinks are synchronous and must not block: they are called
//! from inside host executions.
//!
//! # Available Sinks
//!
//! - [`TracingSink`] - forwards events to `tracing`
//! - [`JsonLinesSink`] - one JSON object per line to any writer
//! - [`MemorySink`] - collects events in memory
//! - [`MultiSink`] - fans out to several sinks
//! - [`NullSink`] - discards everything

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Event Types
// ============================================================================

/// Event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// A run has started
    RunStarted,
    /// A step has started
    StepStarted,
    /// A task has started on a host
    TaskStarted,
    /// A command was issued
    Command,
    /// A command or transfer that would have run
    DryRun,
    /// A task succeeded on a host
    Success,
    /// A task failed on a host
    Failure,
    /// A task was skipped on a host
    Skipped,
    /// A failed attempt is being retried
    Retry,
    /// A step has finished on all its hosts
    StepFinished,
    /// A run reached a terminal state
    RunFinished,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::RunStarted => "run_started",
            EventStatus::StepStarted => "step_started",
            EventStatus::TaskStarted => "task_started",
            EventStatus::Command => "command",
            EventStatus::DryRun => "dry_run",
            EventStatus::Success => "success",
            EventStatus::Failure => "failure",
            EventStatus::Skipped => "skipped",
            EventStatus::Retry => "retry",
            EventStatus::StepFinished => "step_finished",
            EventStatus::RunFinished => "run_finished",
        };
        f.write_str(s)
    }
}

/// A structured event emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Run correlation id
    pub run_id: Uuid,
    /// Host the event concerns, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Task or step name, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Event kind
    pub status: EventStatus,
    /// Free-form detail
    pub message: String,
}

impl RunEvent {
    /// Create a run-level event
    pub fn new(run_id: Uuid, status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id,
            host: None,
            task: None,
            status,
            message: message.into(),
        }
    }

    /// Attach a host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Attach a task name
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives run events
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: &RunEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RunEvent) {
        let host = event.host.as_deref().unwrap_or("-");
        let task = event.task.as_deref().unwrap_or("-");
        match event.status {
            EventStatus::Failure => tracing::error!(
                run_id = %event.run_id,
                host = %host,
                task = %task,
                status = %event.status,
                "{}",
                event.message
            ),
            EventStatus::Retry | EventStatus::Skipped => tracing::warn!(
                run_id = %event.run_id,
                host = %host,
                task = %task,
                status = %event.status,
                "{}",
                event.message
            ),
            EventStatus::Command | EventStatus::TaskStarted => tracing::debug!(
                run_id = %event.run_id,
                host = %host,
                task = %task,
                status = %event.status,
                "{}",
                event.message
            ),
            _ => tracing::info!(
                run_id = %event.run_id,
                host = %host,
                task = %task,
                status = %event.status,
                "{}",
                event.message
            ),
        }
    }
}

/// Writes one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Create a sink writing to `writer`
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &RunEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize run event");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "Failed to write run event");
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind
    pub fn with_status(&self, status: EventStatus) -> Vec<RunEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &RunEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Delivers every event to each inner sink, in order
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MultiSink {
    fn emit(&self, event: &RunEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Discards events
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &RunEvent) {}
}
