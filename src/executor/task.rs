//! Task definition and execution
//!
//! A [`Task`] is a named unit of remote work. Its body receives a
//! [`TaskContext`] giving access to the host, its session, the execution
//! context and the event sink. Bodies are either closures
//! ([`Task::from_fn`]), ordered command scripts ([`Task::script`]), file
//! uploads ([`Task::upload`]) or any type implementing [`TaskBody`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::callback::{EventSink, EventStatus, RunEvent};
use crate::connection::{
    quote_path, CommandResult, CommandSpec, Connection, ConnectionError, TransferOptions,
};
use crate::error::{Error, Result};
use crate::executor::context::{ExecutionContext, Overrides, ScopeToken, Scoped};
use crate::inventory::Host;

/// Whether re-running a task is safe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Safe to re-run; failed attempts may be retried
    #[default]
    Idempotent,
    /// Must never be repeated blindly
    Destructive,
}

/// Status of a task on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task completed successfully
    Success,
    /// Task failed
    Failure,
    /// Task did not run
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failure => write!(f, "failure"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of a task on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Final status
    pub status: TaskStatus,
    /// Captured output
    pub output: String,
    /// Error detail for failures, reason for skips
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    /// Successful outcome
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            output: output.into(),
            error: None,
        }
    }

    /// Failed outcome
    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            output: output.into(),
            error: Some(error.into()),
        }
    }

    /// Skipped outcome
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Skipped,
            output: String::new(),
            error: Some(reason.into()),
        }
    }

    /// Returns true for failures
    pub fn is_failure(&self) -> bool {
        self.status == TaskStatus::Failure
    }
}

/// The work a task performs
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Run against the host behind `ctx`
    async fn run(&self, ctx: &mut TaskContext) -> Result<TaskOutcome>;
}

/// A named unit of remote work
#[derive(Clone)]
pub struct Task {
    name: String,
    kind: TaskKind,
    required_role: Option<String>,
    body: Arc<dyn TaskBody>,
}

impl Task {
    /// Create an idempotent task from a body
    pub fn new(name: impl Into<String>, body: impl TaskBody + 'static) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Idempotent,
            required_role: None,
            body: Arc::new(body),
        }
    }

    /// Create a task from a closure
    ///
    /// ```rust,ignore
    /// let task = Task::from_fn("uptime", |ctx| {
    ///     Box::pin(async move {
    ///         ctx.run(&CommandSpec::new("uptime")).await?;
    ///         Ok(ctx.success())
    ///     })
    /// });
    /// ```
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, Result<TaskOutcome>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, FnBody(f))
    }

    /// Create a task running `commands` in order, stopping at the first failure
    pub fn script(name: impl Into<String>, commands: Vec<CommandSpec>) -> Self {
        Self::new(name, ScriptBody { commands })
    }

    /// Create a task writing `content` to `path` on the host
    pub fn upload(
        name: impl Into<String>,
        content: impl Into<Vec<u8>>,
        path: impl Into<String>,
        sudo: bool,
    ) -> Self {
        Self::new(
            name,
            UploadBody {
                content: content.into(),
                path: path.into(),
                sudo,
            },
        )
    }

    /// Mark the task destructive; it will never be retried
    pub fn destructive(mut self) -> Self {
        self.kind = TaskKind::Destructive;
        self
    }

    /// Restrict the task to hosts carrying `role`
    pub fn requires_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task kind
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Whether failed attempts may be retried
    pub fn is_idempotent(&self) -> bool {
        self.kind == TaskKind::Idempotent
    }

    /// Required role, if any
    pub fn required_role(&self) -> Option<&str> {
        self.required_role.as_deref()
    }

    /// Check that `host` may run this task
    pub fn check_host(&self, host: &Host) -> Result<()> {
        match &self.required_role {
            Some(role) if !host.has_role(role) => Err(Error::RoleMismatch {
                task: self.name.clone(),
                role: role.clone(),
                host: host.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn body(&self) -> Arc<dyn TaskBody> {
        Arc::clone(&self.body)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required_role", &self.required_role)
            .finish()
    }
}

struct FnBody<F>(F);

#[async_trait]
impl<F> TaskBody for FnBody<F>
where
    F: for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> + Send + Sync,
{
    async fn run(&self, ctx: &mut TaskContext) -> Result<TaskOutcome> {
        (self.0)(ctx).await
    }
}

struct ScriptBody {
    commands: Vec<CommandSpec>,
}

#[async_trait]
impl TaskBody for ScriptBody {
    async fn run(&self, ctx: &mut TaskContext) -> Result<TaskOutcome> {
        for command in &self.commands {
            ctx.run(command).await?;
        }
        Ok(ctx.success())
    }
}

struct UploadBody {
    content: Vec<u8>,
    path: String,
    sudo: bool,
}

#[async_trait]
impl TaskBody for UploadBody {
    async fn run(&self, ctx: &mut TaskContext) -> Result<TaskOutcome> {
        ctx.put(&self.content, &self.path, self.sudo).await?;
        Ok(ctx.success())
    }
}

// ============================================================================
// Task context
// ============================================================================

/// Everything a task body can touch while running on one host
pub struct TaskContext {
    host: Arc<Host>,
    session: Option<Arc<dyn Connection>>,
    context: ExecutionContext,
    sink: Arc<dyn EventSink>,
    run_id: Uuid,
    task: String,
    timeout: Option<Duration>,
    output: String,
    session_broken: bool,
}

impl TaskContext {
    /// Create a context for `task` on `host`.
    ///
    /// `session` is `None` in dry-run mode.
    pub fn new(
        host: Arc<Host>,
        session: Option<Arc<dyn Connection>>,
        mut context: ExecutionContext,
        sink: Arc<dyn EventSink>,
        run_id: Uuid,
        task: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        let task = task.into();
        context.bind(&host.name, &task);
        Self {
            host,
            session,
            context,
            sink,
            run_id,
            task,
            timeout,
            output: String::new(),
            session_broken: false,
        }
    }

    /// Target host
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Name of the running task
    pub fn task_name(&self) -> &str {
        &self.task
    }

    /// Current execution context
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Mutable execution context, for explicit push/pop
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Whether commands are only reported
    pub fn is_dry_run(&self) -> bool {
        self.context.is_dry_run()
    }

    /// Output captured so far
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Append a line to the captured output
    pub fn log(&mut self, line: impl AsRef<str>) {
        self.output.push_str(line.as_ref());
        if !self.output.ends_with('\n') {
            self.output.push('\n');
        }
    }

    /// Whether a transport error poisoned the session
    pub(crate) fn session_broken(&self) -> bool {
        self.session_broken
    }

    pub(crate) fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Successful outcome carrying the captured output
    pub fn success(&mut self) -> TaskOutcome {
        TaskOutcome::success(self.take_output())
    }

    /// Skipped outcome
    pub fn skipped(&mut self, reason: impl Into<String>) -> TaskOutcome {
        let mut outcome = TaskOutcome::skipped(reason);
        outcome.output = self.take_output();
        outcome
    }

    fn emit(&self, status: EventStatus, message: impl Into<String>) {
        self.sink.emit(
            &RunEvent::new(self.run_id, status, message)
                .with_host(&self.host.name)
                .with_task(&self.task),
        );
    }

    fn session(&self) -> Result<&Arc<dyn Connection>> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::connection(&self.host.name, ConnectionError::ConnectionClosed))
    }

    fn map_transport(&mut self, err: ConnectionError) -> Error {
        match err {
            ConnectionError::Timeout(secs) => Error::Timeout {
                host: self.host.name.clone(),
                task: self.task.clone(),
                timeout_secs: secs,
            },
            other => {
                if other.poisons_session() {
                    self.session_broken = true;
                }
                Error::connection(&self.host.name, other)
            }
        }
    }

    /// Resolve a remote path against the current working directory
    fn remote_path(&self, path: &str) -> PathBuf {
        match self.context.cwd() {
            Some(cwd) if !path.starts_with('/') && !path.starts_with('~') => {
                Path::new(cwd).join(path)
            }
            _ => PathBuf::from(path),
        }
    }

    /// Run a command under the current scope.
    ///
    /// Exit codes outside the command's accepted set become
    /// [`Error::CommandFailure`]; per-call timeouts become [`Error::Timeout`].
    pub async fn run(&mut self, command: &CommandSpec) -> Result<CommandResult> {
        let mut options = self.context.execute_options();
        options.escalate = command.is_sudo();
        options.timeout = self.timeout.map(|t| t.as_secs().max(1));
        options
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        let rendered = command.render();

        if self.is_dry_run() {
            let line = options.compose(&rendered);
            self.emit(EventStatus::DryRun, line.clone());
            self.log(format!("[dry-run] {}", line));
            return Ok(CommandResult::success(String::new(), String::new()));
        }

        self.emit(EventStatus::Command, command.to_string());
        let session = Arc::clone(self.session()?);
        let result = match session.execute(&rendered, Some(options)).await {
            Ok(result) => result,
            Err(e) => return Err(self.map_transport(e)),
        };

        if !result.stdout.is_empty() {
            self.log(&result.stdout);
        }
        if !result.stderr.is_empty() {
            self.log(&result.stderr);
        }

        if command.accepts(result.exit_code) {
            Ok(result)
        } else {
            Err(Error::CommandFailure {
                host: self.host.name.clone(),
                task: self.task.clone(),
                command: command.to_string(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            })
        }
    }

    /// Write `content` to `path` on the host.
    ///
    /// With `sudo`, the content is staged in `/tmp` and moved into place
    /// with an escalated `mv`.
    pub async fn put(&mut self, content: impl AsRef<[u8]>, path: &str, sudo: bool) -> Result<()> {
        let content = content.as_ref();
        let target = self.remote_path(path);

        if self.is_dry_run() {
            let line = format!(
                "put {} bytes -> {}{}",
                content.len(),
                target.display(),
                if sudo { " (sudo)" } else { "" }
            );
            self.emit(EventStatus::DryRun, line.clone());
            self.log(format!("[dry-run] {}", line));
            return Ok(());
        }

        self.emit(
            EventStatus::Command,
            format!("put {} bytes -> {}", content.len(), target.display()),
        );
        let session = Arc::clone(self.session()?);

        if sudo {
            let staged = format!("/tmp/rollout-{}", Uuid::new_v4());
            if let Err(e) = session
                .upload_content(content, Path::new(&staged), Some(TransferOptions::new()))
                .await
            {
                return Err(self.transfer_error(e));
            }
            // The target keeps a leading `~/` unquoted so the shell expands it
            let mv = CommandSpec::shell(format!(
                "mv {} {}",
                shell_words::quote(&staged),
                quote_path(&target.to_string_lossy())
            ))
            .sudo();
            self.run(&mv).await?;
        } else {
            let options = TransferOptions::new().with_create_dirs();
            if let Err(e) = session.upload_content(content, &target, Some(options)).await {
                return Err(self.transfer_error(e));
            }
        }

        self.log(format!("uploaded {}", target.display()));
        Ok(())
    }

    /// Read a file from the host
    pub async fn get(&mut self, path: &str) -> Result<Vec<u8>> {
        let target = self.remote_path(path);

        if self.is_dry_run() {
            let line = format!("get {}", target.display());
            self.emit(EventStatus::DryRun, line.clone());
            self.log(format!("[dry-run] {}", line));
            return Ok(Vec::new());
        }

        self.emit(EventStatus::Command, format!("get {}", target.display()));
        let session = Arc::clone(self.session()?);
        match session.download_content(&target).await {
            Ok(content) => Ok(content),
            Err(e) => Err(self.transfer_error(e)),
        }
    }

    /// Check whether a path exists on the host
    pub async fn exists(&mut self, path: &str) -> Result<bool> {
        let target = self.remote_path(path);

        if self.is_dry_run() {
            let line = format!("test -e {}", target.display());
            self.emit(EventStatus::DryRun, line.clone());
            self.log(format!("[dry-run] {}", line));
            return Ok(false);
        }

        let session = Arc::clone(self.session()?);
        match session.path_exists(&target).await {
            Ok(exists) => Ok(exists),
            Err(e) => Err(self.map_transport(e)),
        }
    }

    fn transfer_error(&mut self, err: ConnectionError) -> Error {
        match err {
            ConnectionError::TransferFailed(message) => {
                Error::transfer(&self.host.name, message)
            }
            other => self.map_transport(other),
        }
    }

    /// Run another task as a sub-step, in its own scope.
    ///
    /// The sub-task's overrides end with it. Its output is appended to this
    /// task's output whether it succeeds or fails. A scope the sub-task leaves
    /// open is latched on the context, so the run halts even when the caller
    /// discards the returned error.
    pub async fn invoke(&mut self, task: &Task) -> Result<TaskOutcome> {
        task.check_host(&self.host)?;
        self.emit(EventStatus::TaskStarted, format!("sub-task {}", task.name()));

        let parent_output = std::mem::take(&mut self.output);
        let token = self.context.push(Overrides::new());
        let result = task.body().run(self).await;
        let popped = self.context.pop(token);

        let sub_output = std::mem::replace(&mut self.output, parent_output);
        self.output.push_str(&sub_output);

        if let Err(violation) = popped {
            if let Error::ContextScopeViolation { message, .. } = &violation {
                self.context.latch(message.clone());
            }
            return Err(violation);
        }

        let outcome = result?;
        self.output.push_str(&outcome.output);
        Ok(outcome)
    }
}

impl Scoped for TaskContext {
    fn enter(&mut self, overrides: Overrides) -> ScopeToken {
        self.context.push(overrides)
    }

    fn exit(&mut self, token: ScopeToken) -> Result<()> {
        self.context.pop(token)
    }

    fn latch_violation(&mut self, message: String) {
        self.context.latch(message);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("host", &self.host.name)
            .field("task", &self.task)
            .field(
                "session",
                &self.session.as_ref().map(|s| s.identifier().to_string()),
            )
            .field("depth", &self.context.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::MemorySink;
    use crate::connection::LocalConnection;

    fn local_ctx(dry_run: bool, sink: Arc<MemorySink>) -> TaskContext {
        let mut host = Host::new("web1");
        host.add_role("web");
        let session: Option<Arc<dyn Connection>> = if dry_run {
            None
        } else {
            Some(Arc::new(LocalConnection::with_identifier("web1")))
        };
        TaskContext::new(
            Arc::new(host),
            session,
            ExecutionContext::new(dry_run),
            sink,
            Uuid::new_v4(),
            "test",
            Some(Duration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(false, sink.clone());
        ctx.run(&CommandSpec::new("echo").arg("hello")).await.unwrap();
        assert_eq!(ctx.output(), "hello\n");
        assert_eq!(sink.with_status(EventStatus::Command).len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_exit_code_is_command_failure() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(false, sink);
        let err = ctx.run(&CommandSpec::shell("exit 4")).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailure { exit_code: 4, .. }));

        let ok = ctx.run(&CommandSpec::shell("exit 4").allow_failure()).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_dry_run_never_executes() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(true, sink.clone());
        {
            let mut scoped = ctx.with_overrides(Overrides::new().cwd("/srv/app"));
            scoped
                .run(&CommandSpec::new("rm").args(["-rf", "build"]))
                .await
                .unwrap();
        }
        assert_eq!(ctx.output(), "[dry-run] cd /srv/app && rm -rf build\n");
        assert_eq!(sink.with_status(EventStatus::DryRun).len(), 1);
        assert!(sink.with_status(EventStatus::Command).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_env_name_never_reaches_the_shell() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(true, sink.clone());
        let mut scoped = ctx.with_overrides(Overrides::new().env("A;touch pwned", "1"));

        let err = scoped.run(&CommandSpec::new("true")).await.unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("A;touch pwned")));
        drop(scoped);
        assert!(sink.with_status(EventStatus::DryRun).is_empty());
    }

    #[tokio::test]
    async fn test_invoke_checks_role_and_scopes() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(true, sink);

        let wrong = Task::script("db only", vec![]).requires_role("db");
        assert!(matches!(
            ctx.invoke(&wrong).await,
            Err(Error::RoleMismatch { .. })
        ));

        let leaky = Task::from_fn("leaky", |ctx| {
            Box::pin(async move {
                let token = ctx.context_mut().push(Overrides::new().env("X", "1"));
                std::mem::forget(token);
                Ok(ctx.success())
            })
        });
        let err = ctx.invoke(&leaky).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(ctx.context().get_env("X").is_none());
    }

    #[tokio::test]
    async fn test_invoke_leak_wins_over_sub_task_failure() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(false, sink);

        let leaky_and_failing = Task::from_fn("leaky and failing", |ctx| {
            Box::pin(async move {
                std::mem::forget(ctx.context_mut().push(Overrides::new().cwd("/tmp")));
                ctx.run(&CommandSpec::shell("exit 3")).await?;
                Ok(ctx.success())
            })
        });

        let err = ctx.invoke(&leaky_and_failing).await.unwrap_err();
        assert!(matches!(err, Error::ContextScopeViolation { .. }));
        assert!(matches!(
            ctx.context_mut().take_violation(),
            Some(Error::ContextScopeViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_keeps_parent_and_sub_task_output() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(true, sink);
        let sub = Task::from_fn("sub", |ctx| {
            Box::pin(async move {
                ctx.log("sub-line");
                Ok(ctx.success())
            })
        });

        ctx.log("before");
        ctx.invoke(&sub).await.unwrap();
        ctx.log("after");

        assert_eq!(ctx.success().output, "before\nsub-line\nafter\n");
    }

    #[tokio::test]
    async fn test_invoke_keeps_output_of_failed_sub_task() {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = local_ctx(false, sink);
        let sub = Task::script(
            "sub",
            vec![CommandSpec::new("echo").arg("partial"), CommandSpec::shell("exit 2")],
        );

        ctx.log("before");
        assert!(ctx.invoke(&sub).await.is_err());
        assert_eq!(ctx.output(), "before\npartial\n");
    }
}
