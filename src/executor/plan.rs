//! Task plans: ordered steps, each fanning one task out across a target.

use std::fmt;
use std::sync::Arc;

use crate::executor::context::Overrides;
use crate::executor::task::Task;
use crate::inventory::Host;

/// Hosts a step runs against
#[derive(Debug, Clone)]
pub enum Target {
    /// Every host of a role, in configured order
    Role(String),
    /// An explicit host list
    Hosts(Vec<Arc<Host>>),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Role(role) => write!(f, "role '{}'", role),
            Target::Hosts(hosts) => write!(f, "{} explicit host(s)", hosts.len()),
        }
    }
}

/// One unit of sequencing: a task and the hosts it fans out to
#[derive(Debug, Clone)]
pub struct Step {
    pub task: Task,
    pub target: Target,
    /// Failures are recorded but do not abort later steps
    pub best_effort: bool,
    /// Attempts per host for idempotent tasks
    pub max_attempts: u32,
    /// Runs even after an earlier step aborted the run
    pub always_run: bool,
    /// Context overrides applied around the task on every host
    pub overrides: Overrides,
}

impl Step {
    /// Run `task` on every host of `role`
    pub fn on_role(task: Task, role: impl Into<String>) -> Self {
        Self::new(task, Target::Role(role.into()))
    }

    /// Run `task` on an explicit host list
    pub fn on_hosts(task: Task, hosts: Vec<Arc<Host>>) -> Self {
        Self::new(task, Target::Hosts(hosts))
    }

    fn new(task: Task, target: Target) -> Self {
        Self {
            task,
            target,
            best_effort: false,
            max_attempts: 1,
            always_run: false,
            overrides: Overrides::new(),
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Mark this step as cleanup
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Role named by the target, if any
    pub fn role(&self) -> Option<&str> {
        match &self.target {
            Target::Role(role) => Some(role),
            Target::Hosts(_) => None,
        }
    }
}

/// An ordered list of steps
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub name: String,
    pub steps: Vec<Step>,
}

impl TaskPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Append every step of `other`
    pub fn extend(mut self, other: TaskPlan) -> Self {
        self.steps.extend(other.steps);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
