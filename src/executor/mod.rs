//! Core execution engine for Rollout
//!
//! This module provides the task runner with:
//! - Sequential steps, each fanned out across its hosts in parallel
//! - Bounded fan-out through a semaphore
//! - Best-effort steps, per-host retries for idempotent tasks
//! - Cleanup steps that run after an aborted run
//! - Cooperative cancellation
//! - Dry-run support

pub mod context;
pub mod plan;
pub mod report;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::callback::{EventSink, EventStatus, RunEvent};
use crate::connection::ConnectionPool;
use crate::error::{Error, Result};
use crate::inventory::{Host, Inventory};

pub use context::{ContextSnapshot, ExecutionContext, Overrides, ScopeGuard, ScopeToken, Scoped};
pub use plan::{Step, Target, TaskPlan};
pub use report::{OutcomeCounts, ReportEntry, ResultAggregator, RunReport, RunStatus};
pub use task::{Task, TaskBody, TaskContext, TaskKind, TaskOutcome, TaskStatus};

/// Default number of hosts a step runs on concurrently
pub const DEFAULT_FAN_OUT: usize = 5;

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for a single run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Report commands instead of running them
    pub dry_run: bool,
    /// Maximum concurrent host executions within a step
    pub max_fan_out: usize,
    /// Per-command timeout
    pub command_timeout: Option<Duration>,
    /// Environment every task starts with
    pub base_env: IndexMap<String, String>,
    /// Run-wide cancellation flag
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_fan_out: DEFAULT_FAN_OUT,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            base_env: IndexMap::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn max_fan_out(mut self, n: usize) -> Self {
        self.max_fan_out = n.max(1);
        self
    }

    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// How one host execution ended
enum HostEnd {
    Done { failed: bool },
    NotStarted,
    Fatal(Error),
}

/// Per-step state shared by every host execution of the step
struct StepJob {
    step_index: usize,
    task: Task,
    role: Option<String>,
    overrides: Overrides,
    attempts_allowed: u32,
    best_effort: bool,
    base: ExecutionContext,
    pool: ConnectionPool,
    sink: Arc<dyn EventSink>,
    aggregator: Arc<ResultAggregator>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    halt: CancellationToken,
}

/// One host of a step
#[derive(Clone)]
struct HostJob {
    step: Arc<StepJob>,
    host_index: usize,
    host: Arc<Host>,
}

impl HostJob {
    fn emit(&self, status: EventStatus, message: impl Into<String>) {
        self.step.sink.emit(
            &RunEvent::new(self.step.aggregator.run_id(), status, message)
                .with_host(&self.host.name)
                .with_task(self.step.task.name()),
        );
    }

    fn record(&self, outcome: TaskOutcome, attempts: u32) {
        let status = match outcome.status {
            TaskStatus::Success => EventStatus::Success,
            TaskStatus::Failure => EventStatus::Failure,
            TaskStatus::Skipped => EventStatus::Skipped,
        };
        let message = outcome
            .error
            .clone()
            .unwrap_or_else(|| format!("{} after {} attempt(s)", outcome.status, attempts));
        self.emit(status, message);

        self.step.aggregator.record(ReportEntry {
            step: self.step.step_index,
            host_index: self.host_index,
            host: self.host.name.clone(),
            task: self.step.task.name().to_string(),
            outcome,
            attempts,
            best_effort: self.step.best_effort,
        });
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.step.cancel.is_cancelled() {
            Some("cancelled")
        } else if self.step.halt.is_cancelled() {
            Some("halted")
        } else {
            None
        }
    }

    /// Run the task on this host, retrying idempotent failures
    async fn execute(self, semaphore: Arc<Semaphore>) -> HostEnd {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.record(TaskOutcome::skipped("fan-out limiter closed"), 0);
                return HostEnd::NotStarted;
            }
        };

        if let Some(reason) = self.stop_reason() {
            self.record(TaskOutcome::skipped(reason), 0);
            return HostEnd::NotStarted;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.emit(EventStatus::TaskStarted, format!("attempt {}", attempt));

            let outcome = match self.attempt().await {
                Ok(outcome) => outcome,
                Err(fatal) => {
                    error!(host = %self.host.name, task = %self.step.task.name(), error = %fatal, "Fatal error, halting run");
                    self.step.halt.cancel();
                    self.record(TaskOutcome::failure("", fatal.to_string()), attempt);
                    return HostEnd::Fatal(fatal);
                }
            };

            if outcome.is_failure() && attempt < self.step.attempts_allowed && self.stop_reason().is_none() {
                warn!(
                    host = %self.host.name,
                    task = %self.step.task.name(),
                    attempt,
                    "Task failed, retrying"
                );
                self.emit(
                    EventStatus::Retry,
                    format!(
                        "attempt {} failed: {}",
                        attempt,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                );
                continue;
            }

            let failed = outcome.is_failure();
            self.record(outcome, attempt);
            return HostEnd::Done { failed };
        }
    }

    /// One attempt. Only defects are returned as `Err`; every host-scoped
    /// error becomes a failed outcome.
    async fn attempt(&self) -> Result<TaskOutcome> {
        let session = if self.step.base.is_dry_run() {
            None
        } else {
            match self.step.pool.acquire(&self.host).await {
                Ok(session) => Some(session),
                Err(e) => return Ok(TaskOutcome::failure("", e.to_string())),
            }
        };

        let mut context = self.step.base.clone();
        let role_token = context.push(match &self.step.role {
            Some(role) => Overrides::new().role(role.clone()),
            None => Overrides::new(),
        });
        let step_token = context.push(self.step.overrides.clone());

        let mut ctx = TaskContext::new(
            Arc::clone(&self.host),
            session.as_ref().and_then(|s| s.connection()),
            context,
            Arc::clone(&self.step.sink),
            self.step.aggregator.run_id(),
            self.step.task.name(),
            self.step.timeout,
        );

        let result = self.step.task.body().run(&mut ctx).await;

        let popped = ctx
            .context_mut()
            .pop(step_token)
            .and_then(|_| ctx.context_mut().pop(role_token));
        if let Some(violation) = ctx.context_mut().take_violation() {
            return Err(violation);
        }
        popped?;

        if let Some(session) = session {
            if ctx.session_broken() {
                self.step.pool.invalidate(session).await;
            } else {
                self.step.pool.release(session);
            }
        }

        match result {
            Ok(mut outcome) => {
                let captured = ctx.take_output();
                if !captured.is_empty() {
                    outcome.output = captured + &outcome.output;
                }
                Ok(outcome)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(host = %self.host.name, task = %self.step.task.name(), error = %e, "Task failed");
                Ok(TaskOutcome::failure(ctx.take_output(), e.to_string()))
            }
        }
    }
}

/// Executes task plans against an inventory
pub struct Runner {
    pool: ConnectionPool,
    sink: Arc<dyn EventSink>,
}

impl Runner {
    /// Create a runner drawing sessions from `pool` and reporting to `sink`
    pub fn new(pool: ConnectionPool, sink: Arc<dyn EventSink>) -> Self {
        Self { pool, sink }
    }

    /// The session pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn emit(&self, run_id: Uuid, status: EventStatus, task: Option<&str>, message: impl Into<String>) {
        let mut event = RunEvent::new(run_id, status, message);
        if let Some(task) = task {
            event = event.with_task(task);
        }
        self.sink.emit(&event);
    }

    /// Resolve a step's hosts and check them against the task's role
    fn resolve_step(&self, step: &Step, inventory: &Inventory) -> Result<Vec<Arc<Host>>> {
        let hosts = match &step.target {
            Target::Role(role) => inventory.resolve(role)?,
            Target::Hosts(hosts) => hosts.clone(),
        };
        for host in &hosts {
            step.task.check_host(host)?;
        }
        Ok(hosts)
    }

    /// Execute `plan` and return its report.
    ///
    /// Every step is resolved before anything runs; resolution errors are
    /// returned without touching any host. A [`Error::ContextScopeViolation`]
    /// halts the run and is returned once in-flight hosts finish.
    #[instrument(skip(self, plan, inventory, options), fields(plan = %plan.name, steps = plan.steps.len()))]
    pub async fn run(
        &self,
        plan: &TaskPlan,
        inventory: &Inventory,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let resolved = plan
            .steps
            .iter()
            .map(|step| self.resolve_step(step, inventory))
            .collect::<Result<Vec<_>>>()?;

        let run_id = Uuid::new_v4();
        let aggregator = Arc::new(ResultAggregator::new(run_id, &plan.name));
        aggregator.start();
        info!(run_id = %run_id, dry_run = options.dry_run, "Starting run");
        self.emit(
            run_id,
            EventStatus::RunStarted,
            None,
            format!("{} ({} steps)", plan.name, plan.steps.len()),
        );

        let semaphore = Arc::new(Semaphore::new(options.max_fan_out.max(1)));
        let base = ExecutionContext::new(options.dry_run).with_env(options.base_env.clone());
        let halt = CancellationToken::new();

        let mut aborted = false;
        let mut cancelled = false;
        let mut fatal = None;

        for (index, (step, hosts)) in plan.steps.iter().zip(resolved).enumerate() {
            if options.cancel.is_cancelled() {
                if !cancelled {
                    warn!(step = index, "Run cancelled, not starting further steps");
                }
                cancelled = true;
                self.skip_step(&aggregator, index, step, &hosts, "cancelled");
                continue;
            }
            if aborted && !step.always_run {
                debug!(step = index, task = %step.task.name(), "Skipping step after failure");
                continue;
            }

            let job = Arc::new(StepJob {
                step_index: index,
                task: step.task.clone(),
                role: step.role().map(str::to_string),
                overrides: step.overrides.clone(),
                attempts_allowed: if step.task.is_idempotent() {
                    step.max_attempts.max(1)
                } else {
                    1
                },
                best_effort: step.best_effort,
                base: base.clone(),
                pool: self.pool.clone(),
                sink: Arc::clone(&self.sink),
                aggregator: Arc::clone(&aggregator),
                timeout: options.command_timeout,
                cancel: options.cancel.clone(),
                halt: halt.clone(),
            });

            let ends = self.run_step(step, hosts, job, &semaphore).await;

            let mut step_failed = false;
            for end in ends {
                match end {
                    HostEnd::Done { failed } => step_failed |= failed,
                    HostEnd::NotStarted => cancelled |= options.cancel.is_cancelled(),
                    HostEnd::Fatal(e) => {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                }
            }

            if fatal.is_some() {
                break;
            }
            if step_failed && !step.best_effort && !aborted {
                warn!(step = index, task = %step.task.name(), "Step failed, aborting remaining steps");
                aborted = true;
            }
        }

        let status = aggregator.finish(aborted || fatal.is_some(), cancelled);
        info!(run_id = %run_id, status = %status, cancelled, "Run finished");
        self.emit(run_id, EventStatus::RunFinished, None, status.to_string());

        match fatal {
            Some(e) => Err(e),
            None => aggregator.summarize(),
        }
    }

    /// Record every host of a step that will never start
    fn skip_step(
        &self,
        aggregator: &ResultAggregator,
        index: usize,
        step: &Step,
        hosts: &[Arc<Host>],
        reason: &str,
    ) {
        for (host_index, host) in hosts.iter().enumerate() {
            self.sink.emit(
                &RunEvent::new(aggregator.run_id(), EventStatus::Skipped, reason)
                    .with_host(&host.name)
                    .with_task(step.task.name()),
            );
            aggregator.record(ReportEntry {
                step: index,
                host_index,
                host: host.name.clone(),
                task: step.task.name().to_string(),
                outcome: TaskOutcome::skipped(reason),
                attempts: 0,
                best_effort: step.best_effort,
            });
        }
    }

    /// Fan one step out across its hosts and wait for every host to finish
    #[instrument(skip_all, fields(step = job.step_index, task = %step.task.name(), hosts = hosts.len()))]
    async fn run_step(
        &self,
        step: &Step,
        hosts: Vec<Arc<Host>>,
        job: Arc<StepJob>,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<HostEnd> {
        let run_id = job.aggregator.run_id();
        self.emit(
            run_id,
            EventStatus::StepStarted,
            Some(step.task.name()),
            format!("{} on {}", step.task.name(), step.target),
        );

        let jobs: Vec<HostJob> = hosts
            .into_iter()
            .enumerate()
            .map(|(host_index, host)| HostJob {
                step: Arc::clone(&job),
                host_index,
                host,
            })
            .collect();

        // Run on all hosts in parallel (limited by semaphore)
        let handles: Vec<_> = jobs
            .iter()
            .cloned()
            .map(|host_job| {
                let semaphore = Arc::clone(semaphore);
                tokio::spawn(host_job.execute(semaphore))
            })
            .collect();

        let results = join_all(handles).await;

        let ends: Vec<HostEnd> = results
            .into_iter()
            .zip(jobs)
            .map(|(result, host_job)| match result {
                Ok(end) => end,
                Err(join_error) => {
                    error!(host = %host_job.host.name, error = %join_error, "Host execution panicked");
                    host_job.record(
                        TaskOutcome::failure("", format!("task panicked: {}", join_error)),
                        1,
                    );
                    HostEnd::Done { failed: true }
                }
            })
            .collect();

        self.emit(
            run_id,
            EventStatus::StepFinished,
            Some(step.task.name()),
            format!("{} host(s)", ends.len()),
        );
        ends
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").field("pool", &self.pool).finish()
    }
}
