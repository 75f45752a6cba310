//! Execution context for task invocations
//!
//! This module provides:
//! - The per-host [`ExecutionContext`] (environment, working directory,
//!   command prefixes, active role, dry-run flag)
//! - Scoped overrides with guaranteed restore ([`Scoped`], [`ScopeGuard`])
//!
//! Every `push` must be matched by a `pop` of the same token. Guards pop on
//! drop, including during unwinding. An unbalanced pop is a defect: it is
//! reported as [`Error::ContextScopeViolation`] and latched on the context so
//! the runner can halt the run.

use indexmap::IndexMap;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use tracing::trace;

use crate::connection::{CommandSpec, ExecuteOptions};
use crate::error::{Error, Result};

/// Overrides applied by one scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    env: Vec<(String, String)>,
    cwd: Option<String>,
    prefixes: Vec<CommandSpec>,
    role: Option<String>,
}

impl Overrides {
    /// No overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Change directory.
    ///
    /// Relative directories nest inside the current one; absolute and
    /// home-relative ones replace it.
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Chain a command in front of every command run in the scope
    pub fn prefix(mut self, command: CommandSpec) -> Self {
        self.prefixes.push(command);
        self
    }

    /// Set the active role
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Returns true if nothing is overridden
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.cwd.is_none() && self.prefixes.is_empty() && self.role.is_none()
    }
}

/// Observable state of a context, used to compare before and after a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    /// Environment variables
    pub env: IndexMap<String, String>,
    /// Effective working directory
    pub cwd: Option<String>,
    /// Rendered prefixes
    pub prefixes: Vec<String>,
    /// Active role
    pub role: Option<String>,
}

/// Proof of a `push`; must be handed back to `pop`
#[derive(Debug)]
#[must_use = "a pushed scope must be popped"]
pub struct ScopeToken {
    depth: usize,
    id: u64,
}

#[derive(Debug, Clone)]
struct Frame {
    id: u64,
    env: IndexMap<String, String>,
    cwd_len: usize,
    prefixes_len: usize,
    role: Option<String>,
}

/// Per-host execution state threaded through task bodies
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    env: IndexMap<String, String>,
    cwd: Vec<String>,
    prefixes: Vec<CommandSpec>,
    role: Option<String>,
    dry_run: bool,
    frames: Vec<Frame>,
    next_frame: u64,
    host: Option<String>,
    task: Option<String>,
    violation: Option<String>,
}

impl ExecutionContext {
    /// Create a context; the dry-run flag is fixed for its lifetime
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Seed the base environment
    pub fn with_env(mut self, env: IndexMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Record which host and task own this context, for diagnostics
    pub(crate) fn bind(&mut self, host: &str, task: &str) {
        self.host = Some(host.to_string());
        self.task = Some(task.to_string());
    }

    /// Environment variables
    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    /// Look up one environment variable
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Effective working directory
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.last().map(String::as_str)
    }

    /// Active prefixes, outermost first
    pub fn prefixes(&self) -> &[CommandSpec] {
        &self.prefixes
    }

    /// Active role
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Whether commands are only reported, never run
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Number of open scopes
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Capture the observable state
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            env: self.env.clone(),
            cwd: self.cwd().map(str::to_string),
            prefixes: self.prefixes.iter().map(CommandSpec::render).collect(),
            role: self.role.clone(),
        }
    }

    /// Transport options reflecting the current scope
    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            cwd: self.cwd().map(str::to_string),
            env: self.env.clone(),
            prefixes: self.prefixes.iter().map(CommandSpec::render).collect(),
            timeout: None,
            escalate: false,
        }
    }

    /// Open a scope applying `overrides`
    pub fn push(&mut self, overrides: Overrides) -> ScopeToken {
        let id = self.next_frame;
        self.next_frame += 1;
        self.frames.push(Frame {
            id,
            env: self.env.clone(),
            cwd_len: self.cwd.len(),
            prefixes_len: self.prefixes.len(),
            role: self.role.clone(),
        });

        for (key, value) in overrides.env {
            self.env.insert(key, value);
        }
        if let Some(dir) = overrides.cwd {
            let next = match self.cwd() {
                Some(current) if !is_rooted(&dir) => {
                    format!("{}/{}", current.trim_end_matches('/'), dir)
                }
                _ => dir,
            };
            self.cwd.push(next);
        }
        self.prefixes.extend(overrides.prefixes);
        if overrides.role.is_some() {
            self.role = overrides.role;
        }

        trace!(depth = self.frames.len(), "Pushed context scope");
        ScopeToken {
            depth: self.frames.len(),
            id,
        }
    }

    /// Close the scope opened by `token`, restoring the prior state exactly.
    ///
    /// Popping out of order is a violation. Scopes left open inside the
    /// popped one are unwound along with it.
    pub fn pop(&mut self, token: ScopeToken) -> Result<()> {
        let open = self.frames.len();
        let owned = token.depth > 0
            && self
                .frames
                .get(token.depth - 1)
                .is_some_and(|frame| frame.id == token.id);
        if !owned {
            return Err(self.violation_error(format!(
                "scope at depth {} popped but it is not open ({} open)",
                token.depth, open
            )));
        }

        let leaked = open - token.depth;
        self.frames.truncate(token.depth);
        if let Some(frame) = self.frames.pop() {
            self.env = frame.env;
            self.cwd.truncate(frame.cwd_len);
            self.prefixes.truncate(frame.prefixes_len);
            self.role = frame.role;
        }
        trace!(depth = self.frames.len(), "Popped context scope");

        if leaked > 0 {
            return Err(self.violation_error(format!(
                "{} nested scope(s) left open at depth {}",
                leaked, token.depth
            )));
        }
        Ok(())
    }

    fn violation_error(&self, message: String) -> Error {
        Error::ContextScopeViolation {
            task: self.task.clone().unwrap_or_default(),
            host: self.host.clone().unwrap_or_default(),
            message,
        }
    }

    /// Remember a violation that could not be returned to a caller
    pub(crate) fn latch(&mut self, message: String) {
        if self.violation.is_none() {
            self.violation = Some(message);
        }
    }

    /// Take a latched violation, if any
    pub fn take_violation(&mut self) -> Option<Error> {
        self.violation.take().map(|message| self.violation_error(message))
    }
}

fn is_rooted(dir: &str) -> bool {
    dir.starts_with('/') || dir == "~" || dir.starts_with("~/")
}

// ============================================================================
// Scoped overrides
// ============================================================================

/// Anything that can open and close override scopes
pub trait Scoped {
    /// Open a scope
    fn enter(&mut self, overrides: Overrides) -> ScopeToken;

    /// Close a scope
    fn exit(&mut self, token: ScopeToken) -> Result<()>;

    /// Record a violation detected where it cannot be returned
    fn latch_violation(&mut self, message: String);

    /// Apply `overrides` until the returned guard is dropped
    fn with_overrides(&mut self, overrides: Overrides) -> ScopeGuard<'_, Self>
    where
        Self: Sized,
    {
        let token = self.enter(overrides);
        ScopeGuard {
            target: self,
            token: Some(token),
        }
    }
}

impl Scoped for ExecutionContext {
    fn enter(&mut self, overrides: Overrides) -> ScopeToken {
        self.push(overrides)
    }

    fn exit(&mut self, token: ScopeToken) -> Result<()> {
        self.pop(token)
    }

    fn latch_violation(&mut self, message: String) {
        self.latch(message);
    }
}

/// Restores the scoped value when dropped
pub struct ScopeGuard<'a, S: Scoped> {
    target: &'a mut S,
    token: Option<ScopeToken>,
}

impl<S: Scoped> ScopeGuard<'_, S> {
    /// Close the scope now, returning any violation instead of latching it
    pub fn close(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.target.exit(token),
            None => Ok(()),
        }
    }
}

impl<S: Scoped> Deref for ScopeGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.target
    }
}

impl<S: Scoped> DerefMut for ScopeGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.target
    }
}

impl<S: Scoped> Drop for ScopeGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.target.exit(token) {
                self.target.latch_violation(e.to_string());
            }
        }
    }
}
