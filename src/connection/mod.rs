//! Connection layer for remote host communication.
//!
//! This module provides a unified interface for executing commands and
//! transferring files on target hosts, independent of the transport.
//!
//! # Overview
//!
//! All transports implement the [`Connection`] trait. Sessions are created by
//! a [`Connector`] and handed out by the [`ConnectionPool`](pool::ConnectionPool),
//! which is the only component allowed to keep a session alive between tasks.
//!
//! # Supported Transports
//!
//! - **SSH** (via `russh`, default feature): remote execution and SFTP transfer
//! - **Local**: direct execution on the control node
//!
//! # Example
//!
//! ```rust,ignore
//! use rollout::connection::{ExecuteOptions, LocalConnection, Connection};
//!
//! let conn = LocalConnection::new();
//! let opts = ExecuteOptions::new()
//!     .with_cwd("/opt/app")
//!     .with_env("DJANGO_CONFIGURATION", "Prod");
//! let result = conn.execute("python manage.py check", Some(opts)).await?;
//! println!("Output: {}", result.stdout);
//! ```

/// Structured command descriptors.
pub mod command;

/// Local execution connection implementation.
pub mod local;

/// Session pooling.
pub mod pool;

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod russh;

use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::inventory::{Host, Transport};

pub use command::{CommandSpec, ExitCodes};
pub use local::LocalConnection;
pub use pool::{ConnectionPool, PoolStats, PooledSession};
#[cfg(feature = "russh")]
pub use russh::RusshConnection;

/// Russh-related error type - wraps russh::Error for the Handler trait
#[cfg(feature = "russh")]
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

#[cfg(feature = "russh")]
impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

#[cfg(feature = "russh")]
impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

#[cfg(feature = "russh")]
impl std::error::Error for RusshError {}

#[cfg(feature = "russh")]
impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(format!("Russh error: {}", err))
    }
}

#[cfg(feature = "russh")]
impl From<russh_sftp::client::error::Error> for ConnectionError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        ConnectionError::TransferFailed(format!("SFTP error: {}", e))
    }
}

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload or download operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SSH-specific error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ConnectionError {
    /// Returns true if the session can no longer be trusted for reuse.
    ///
    /// Timeouts and rejected options leave the transport intact; everything
    /// else poisons it.
    pub fn poisons_session(&self) -> bool {
        !matches!(
            self,
            ConnectionError::Timeout(_) | ConnectionError::InvalidConfig(_)
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command (0 typically indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Convenience flag: `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Environment variables to export before the command
    pub env: IndexMap<String, String>,
    /// Commands chained (with `&&`) in front of the command
    pub prefixes: Vec<String>,
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
    /// Run command with `sudo`
    pub escalate: bool,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a prefix command
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable privilege escalation
    pub fn with_escalation(mut self) -> Self {
        self.escalate = true;
        self
    }

    /// Reject environment names that cannot be exported verbatim
    pub fn validate(&self) -> ConnectionResult<()> {
        match self.env.keys().find(|key| !is_valid_env_name(key)) {
            Some(key) => Err(ConnectionError::InvalidConfig(format!(
                "invalid environment variable name '{}'",
                key
            ))),
            None => Ok(()),
        }
    }

    /// Compose the shell line that runs `command` under these options.
    ///
    /// Exports come first so they survive escalation, then the directory
    /// change, then every prefix, each joined with `&&`. Values are quoted.
    pub fn compose(&self, command: &str) -> String {
        let mut line = String::new();
        for (key, value) in &self.env {
            line.push_str(&format!("export {}={}; ", key, shell_words::quote(value)));
        }

        let mut chain: Vec<String> = Vec::with_capacity(self.prefixes.len() + 2);
        if let Some(cwd) = &self.cwd {
            chain.push(format!("cd {}", quote_path(cwd)));
        }
        chain.extend(self.prefixes.iter().cloned());
        chain.push(command.to_string());
        line.push_str(&chain.join(" && "));

        if self.escalate {
            format!("sudo -n -- sh -c {}", shell_words::quote(&line))
        } else {
            line
        }
    }
}

/// Whether `name` matches `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Quote a path for the shell while keeping a leading `~/` expandable.
pub(crate) fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("~/{}", shell_words::quote(rest)),
        _ if path == "~" => "~".to_string(),
        _ => shell_words::quote(path).into_owned(),
    }
}

/// Options for file transfer
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// File mode (permissions) to set
    pub mode: Option<u32>,
    /// Create parent directories if they don't exist
    pub create_dirs: bool,
}

impl TransferOptions {
    /// Create new transfer options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set file mode
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Enable directory creation
    pub fn with_create_dirs(mut self) -> Self {
        self.create_dirs = true;
        self
    }
}

/// The main connection trait that all transport implementations must implement
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier
    fn identifier(&self) -> &str;

    /// Check if the connection is still alive
    async fn is_alive(&self) -> bool;

    /// Execute a command on the remote host
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Upload content directly to a remote file
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Download a file content from the remote host
    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>>;

    /// Check if a path exists on the remote host
    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Creates new sessions for hosts.
///
/// The pool calls this whenever it has no healthy idle session for a host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish and authenticate a new session to `host`.
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>>;
}

/// Connector that dispatches on [`Host::transport`].
#[derive(Debug, Clone)]
pub struct TransportConnector {
    connect_timeout: Duration,
}

impl TransportConnector {
    /// Create a connector with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        match host.transport {
            Transport::Local => Ok(Arc::new(LocalConnection::with_identifier(&host.name))),
            #[cfg(feature = "russh")]
            Transport::Ssh => {
                let conn = RusshConnection::connect(host, self.connect_timeout).await?;
                Ok(Arc::new(conn))
            }
            #[cfg(not(feature = "russh"))]
            Transport::Ssh => {
                let _ = self.connect_timeout;
                Err(ConnectionError::InvalidConfig(
                    "No SSH backend available. Enable the 'russh' feature.".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_plain() {
        let opts = ExecuteOptions::new();
        assert_eq!(opts.compose("uptime"), "uptime");
    }

    #[test]
    fn test_compose_env_cwd_prefix() {
        let opts = ExecuteOptions::new()
            .with_env("CONFIG_SERVER_NAME", "example.org")
            .with_cwd("~/codalab/codalab")
            .with_prefix("source ~/codalab/venv/bin/activate");
        assert_eq!(
            opts.compose("python manage.py syncdb"),
            "export CONFIG_SERVER_NAME=example.org; cd ~/codalab/codalab && \
             source ~/codalab/venv/bin/activate && python manage.py syncdb"
        );
    }

    #[test]
    fn test_compose_escalated_quotes_inner_line() {
        let opts = ExecuteOptions::new().with_cwd("/etc").with_escalation();
        assert_eq!(opts.compose("ls"), "sudo -n -- sh -c 'cd /etc && ls'");
    }

    #[test]
    fn test_compose_quotes_values() {
        let opts = ExecuteOptions::new().with_env("GREETING", "it's here");
        assert_eq!(opts.compose("true"), "export GREETING='it'\\''s here'; true");
    }

    #[test]
    fn test_env_names_validated() {
        assert!(is_valid_env_name("CONFIG_HTTP_PORT"));
        assert!(is_valid_env_name("_private1"));
        assert!(!is_valid_env_name("1ST"));
        assert!(!is_valid_env_name(""));
        assert!(!is_valid_env_name("A;rm -rf ~"));

        assert!(ExecuteOptions::new().with_env("OK", "x").validate().is_ok());
        let err = ExecuteOptions::new()
            .with_env("A;rm -rf ~", "x")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidConfig(_)));
        assert!(!err.poisons_session());
    }

    #[test]
    fn test_quote_path() {
        assert_eq!(quote_path("~/my dir"), "~/'my dir'");
        assert_eq!(quote_path("~"), "~");
        assert_eq!(quote_path("/srv/app"), "/srv/app");
    }

    #[test]
    fn test_command_result_failure() {
        let result = CommandResult::failure(2, "out".into(), "err".into());
        assert!(!result.success);
        assert_eq!((result.exit_code, result.stderr.as_str()), (2, "err"));
    }

    #[test]
    fn test_timeout_does_not_poison_session() {
        assert!(!ConnectionError::Timeout(5).poisons_session());
        assert!(ConnectionError::ConnectionClosed.poisons_session());
    }
}
