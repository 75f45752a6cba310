//! Subcommands module for the rollout CLI
//!
//! Plan-building commands live in [`run`], inventory inspection in
//! [`inventory`]. Both go through a shared [`CommandContext`].

pub mod inventory;
pub mod run;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::output::OutputFormatter;
use crate::cli::Cli;
use rollout::callback::{EventSink, JsonLinesSink, MultiSink, TracingSink};
use rollout::config::DeploymentConfig;
use rollout::connection::{ConnectionPool, TransportConnector};
use rollout::executor::{RunOptions, Runner, TaskPlan};
use rollout::inventory::Inventory;

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration file
    pub config_path: PathBuf,
    /// Output formatter
    pub output: OutputFormatter,
    /// Verbosity level
    pub verbosity: u8,
    /// Dry-run mode
    pub dry_run: bool,
    /// Fan-out override
    pub forks: Option<usize>,
    /// Command timeout override
    pub timeout: Option<Duration>,
    /// Event log file
    pub events: Option<PathBuf>,
    /// Cancelled on Ctrl-C
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &Cli, cancel: CancellationToken) -> Self {
        let output = OutputFormatter::new(!cli.no_color, cli.is_json(), cli.verbosity());

        Self {
            config_path: cli.config.clone(),
            output,
            verbosity: cli.verbosity(),
            dry_run: cli.dry_run,
            forks: cli.forks,
            timeout: cli.timeout.map(Duration::from_secs),
            events: cli.events.clone(),
            cancel,
        }
    }

    /// Load the environment `label` and its inventory
    pub fn load(&self, label: &str) -> Result<(DeploymentConfig, Inventory)> {
        let config = DeploymentConfig::load(&self.config_path, label)?;
        let inventory = config.inventory()?;
        info!(
            label = %label,
            hosts = inventory.host_count(),
            config = %self.config_path.display(),
            "Loaded deployment environment"
        );
        Ok((config, inventory))
    }

    /// Run options from the configuration with command line overrides applied
    pub fn run_options(&self, config: &DeploymentConfig) -> RunOptions {
        let mut options = config.run_options().dry_run(self.dry_run);
        if let Some(forks) = self.forks {
            options = options.max_fan_out(forks);
        }
        if let Some(timeout) = self.timeout {
            options = options.command_timeout(Some(timeout));
        }
        options.cancel = self.cancel.clone();
        options
    }

    /// Tracing, plus the JSON lines event log when one was requested
    fn event_sink(&self) -> Result<Arc<dyn EventSink>> {
        let Some(path) = &self.events else {
            return Ok(Arc::new(TracingSink));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open event log {}", path.display()))?;
        Ok(Arc::new(
            MultiSink::new()
                .with(Arc::new(TracingSink))
                .with(Arc::new(JsonLinesSink::new(file))),
        ))
    }

    /// Execute `plan` and print its report. Returns the process exit code.
    pub async fn execute_plan(
        &self,
        config: &DeploymentConfig,
        inventory: &Inventory,
        plan: TaskPlan,
    ) -> Result<i32> {
        let options = self.run_options(config);
        let connector = Arc::new(TransportConnector::new(config.connect_timeout()));
        let sink = self.event_sink()?;
        let runner = Runner::new(ConnectionPool::new(connector), sink);

        let title = if options.dry_run {
            format!("{} [{}] (dry run)", plan.name, config.label())
        } else {
            format!("{} [{}]", plan.name, config.label())
        };
        self.output.banner(&title.to_uppercase());

        let result = runner.run(&plan, inventory, &options).await;
        runner.pool().close_all().await;
        let report = result?;

        self.output.report(&report);
        Ok(report.exit_code())
    }
}
