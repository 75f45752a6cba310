//! Error types for Rollout.
//!
//! This module defines the crate-wide [`Error`] enum. Variants fall into three
//! scopes that drive how the runner treats them:
//!
//! - **Run-scoped** resolution errors (`UnknownRole`, `DuplicateHost`,
//!   `Cardinality`, `RoleMismatch`, `Config`, ...) abort a run before any
//!   remote work has been dispatched.
//! - **Host-scoped** errors (`Connection`, `CommandFailure`, `Timeout`,
//!   `Transfer`) are caught per host and recorded as a failed outcome.
//! - **Defects** (`ContextScopeViolation`) are never caught and halt the run.

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::ConnectionError;

/// Result type alias for Rollout operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Rollout.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Resolution Errors
    // ========================================================================
    /// The role has no configured hosts.
    #[error("Role '{0}' has no configured hosts")]
    UnknownRole(String),

    /// The same host appears twice within one role.
    #[error("Host '{host}' is listed more than once in role '{role}'")]
    DuplicateHost {
        /// Role being resolved
        role: String,
        /// Duplicated host address
        host: String,
    },

    /// A role was required to resolve to exactly one host.
    #[error("Role '{role}' must resolve to exactly one host, found {found}")]
    Cardinality {
        /// Role being resolved
        role: String,
        /// Number of hosts actually resolved
        found: usize,
    },

    /// A task was targeted at a host that lacks the task's required role.
    #[error("Task '{task}' requires role '{role}' but host '{host}' does not carry it")]
    RoleMismatch {
        /// Task name
        task: String,
        /// Required role
        role: String,
        /// Offending host
        host: String,
    },

    // ========================================================================
    // Host-scoped Errors
    // ========================================================================
    /// Transport-level failure talking to a host.
    #[error("Connection to '{host}' failed: {source}")]
    Connection {
        /// Target host
        host: String,
        /// Underlying transport error
        #[source]
        source: ConnectionError,
    },

    /// A remote command exited with an unexpected status.
    #[error("Command `{command}` failed on '{host}' with exit code {exit_code}")]
    CommandFailure {
        /// Target host
        host: String,
        /// Task that issued the command
        task: String,
        /// Rendered command line
        command: String,
        /// Exit code returned by the remote side
        exit_code: i32,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// A remote call exceeded its per-call timeout.
    #[error("Task '{task}' timed out on '{host}' after {timeout_secs} seconds")]
    Timeout {
        /// Target host
        host: String,
        /// Task that issued the call
        task: String,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    /// File transfer to or from a host failed.
    #[error("File transfer failed on '{host}': {message}")]
    Transfer {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Defects
    // ========================================================================
    /// Unbalanced push/pop on an execution context.
    #[error("Execution context scope violation in task '{task}' on '{host}': {message}")]
    ContextScopeViolation {
        /// Task running when the violation was detected
        task: String,
        /// Host the task was running on
        host: String,
        /// Description of the imbalance
        message: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A named secret is missing from the configuration.
    #[error("Secret '{0}' is not configured")]
    MissingSecret(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Template rendering failed.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// The run report was requested before the run finished.
    #[error("Run report requested before the run reached a terminal state")]
    ReportNotReady,

    // ========================================================================
    // IO / Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl Error {
    /// Creates a new connection error scoped to a host.
    pub fn connection(host: impl Into<String>, source: ConnectionError) -> Self {
        Self::Connection {
            host: host.into(),
            source,
        }
    }

    /// Creates a new transfer error.
    pub fn transfer(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Returns true for programming defects that must halt a run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ContextScopeViolation { .. })
    }

    /// Returns true for configuration-resolution errors raised before dispatch.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Error::UnknownRole(_)
                | Error::DuplicateHost { .. }
                | Error::Cardinality { .. }
                | Error::RoleMismatch { .. }
                | Error::Config(_)
                | Error::MissingSecret(_)
                | Error::ConfigNotFound(_)
        )
    }

    /// Returns true if the error indicates the session itself is broken.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        if self.is_resolution() {
            2
        } else if self.is_fatal() {
            3
        } else {
            1
        }
    }
}
