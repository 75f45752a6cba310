//! # Rollout - Plan-driven remote deployment
//!
//! Rollout runs named deployment plans against the hosts of a configured
//! environment. A plan is an ordered list of steps; each step runs one task
//! on every host of a role, with bounded concurrency, over pooled SSH
//! sessions.
//!
//! ## Core Concepts
//!
//! - **Inventory**: role names mapped to ordered host lists
//! - **Tasks**: named units of work run against one host at a time
//! - **Plans**: ordered steps binding a task to a role or explicit hosts
//! - **Execution context**: scoped environment, working directory and
//!   command prefixes applied to every command a task issues
//! - **Connection pool**: one reusable session per host
//! - **Run report**: ordered (host, task, outcome) triples
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           CLI Interface                              │
//! │              (clap commands building plans from recipes)             │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Runner                                  │
//! │        (steps in order, hosts concurrently, bounded fan-out)         │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │    Inventory    │   │  Execution context  │   │  Result aggregator  │
//! │  (roles → hosts)│   │  (scoped overrides) │   │   (ordered report)  │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Connection pool                               │
//! │                     (SSH via russh, local)                           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use rollout::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = DeploymentConfig::load("deploy.toml", "staging")?;
//!     let inventory = config.inventory()?;
//!     let plan = rollout::recipes::deploy(&config)?;
//!
//!     let pool = ConnectionPool::new(Arc::new(TransportConnector::default()));
//!     let runner = Runner::new(pool, Arc::new(TracingSink));
//!     let report = runner.run(&plan, &inventory, &config.run_options()).await?;
//!     println!("{}", report.status);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use std::sync::Arc;

    // Connection types
    pub use crate::connection::{
        CommandResult, CommandSpec, Connection, ConnectionPool, Connector, ExecuteOptions,
        LocalConnection, TransportConnector,
    };

    // Error types
    pub use crate::error::{Error, Result};

    // Execution
    pub use crate::executor::{
        ExecutionContext, Overrides, RunOptions, RunReport, RunStatus, Runner, Scoped, Step, Task,
        TaskContext, TaskOutcome, TaskPlan,
    };

    // Inventory
    pub use crate::inventory::{Host, Inventory};

    // Configuration
    pub use crate::config::DeploymentConfig;

    // Events
    pub use crate::callback::{EventSink, MemorySink, TracingSink};
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types
pub mod error;

/// Run events and sinks
pub mod callback;

/// Remote command execution and session pooling
pub mod connection;

/// Roles and hosts
pub mod inventory;

/// Plans, tasks, execution context and the runner
pub mod executor;

// ============================================================================
// Deployment
// ============================================================================

/// Deployment configuration
pub mod config;

/// Generated configuration files
pub mod settings;

/// Deployment plans
pub mod recipes;

pub use error::{Error, Result};

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of rollout.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
