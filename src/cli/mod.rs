//! CLI module for rollout
//!
//! Argument parsing and subcommand dispatch. Every deployment command takes
//! the environment label to operate on as its first argument.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// rollout - deploy a web application and its workers over SSH
#[derive(Parser, Debug, Clone)]
#[command(name = "rollout")]
#[command(author = "Rollout Contributors")]
#[command(version)]
#[command(about = "Deploy a web application and its workers over SSH", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the deployment configuration file
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "ROLLOUT_CONFIG",
        default_value = "deploy.toml"
    )]
    pub config: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print commands instead of running them
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Number of hosts a step runs on concurrently
    #[arg(short = 'f', long, global = true)]
    pub forks: Option<usize>,

    /// Per-command timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Log format
    #[arg(long = "log-format", global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Append run events to FILE as JSON lines
    #[arg(long, global = true, value_name = "FILE")]
    pub events: Option<PathBuf>,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// JSON output for scripting
    Json,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Deploy the current tag to the web hosts
    Deploy(commands::run::DeployArgs),

    /// Install the web host from scratch
    Install(commands::run::InstallArgs),

    /// Dump the website database and download it
    #[command(name = "backup-database")]
    BackupDatabase(commands::run::BackupArgs),

    /// Turn maintenance mode on or off
    Maintenance(commands::run::MaintenanceArgs),

    /// Start, stop or restart supervisor on the web hosts
    Supervisor(commands::run::SupervisorArgs),

    /// Deploy or update the compute workers
    #[command(name = "deploy-workers")]
    DeployWorkers(commands::run::DeployWorkersArgs),

    /// Install the packages configured for a role
    Provision(commands::run::ProvisionArgs),

    /// Install the compute workers from scratch and deploy them
    #[command(name = "provision-worker")]
    ProvisionWorker(commands::run::ProvisionWorkerArgs),

    /// List the hosts of an environment
    #[command(name = "list-hosts")]
    ListHosts(commands::inventory::ListHostsArgs),
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get verbosity level
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }

    /// Check if output should be JSON
    pub fn is_json(&self) -> bool {
        self.output == OutputFormat::Json
    }
}
