//! Deployment commands
//!
//! Each command loads its environment, builds a plan from
//! [`rollout::recipes`] and hands it to the runner.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use super::CommandContext;
use rollout::recipes::{self, MaintenanceMode, MysqlChoice, SupervisorAction};

/// Arguments for the deploy command
#[derive(Parser, Debug, Clone)]
pub struct DeployArgs {
    /// Environment label
    pub label: String,
}

impl DeployArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let plan = recipes::deploy(&config)?;
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the install command
#[derive(Parser, Debug, Clone)]
pub struct InstallArgs {
    /// Environment label
    pub label: String,

    /// MySQL components to install (all, mysql, website_db)
    #[arg(long, default_value = "all")]
    pub mysql: MysqlChoice,
}

impl InstallArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let plan = recipes::install(&config, &inventory, self.mysql)?;
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the backup-database command
#[derive(Parser, Debug, Clone)]
pub struct BackupArgs {
    /// Environment label
    pub label: String,

    /// Local directory the dump is written to
    #[arg(long)]
    pub dest: Option<PathBuf>,
}

impl BackupArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let dest = recipes::backup_dir(&config, self.dest.clone())?;
        ctx.output
            .info(&format!("Backups are written to {}", dest.display()));
        let plan = recipes::backup_database(&config, &inventory, &dest)?;
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the maintenance command
#[derive(Parser, Debug, Clone)]
pub struct MaintenanceArgs {
    /// Environment label
    pub label: String,

    /// begin or end
    pub mode: MaintenanceMode,
}

impl MaintenanceArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let plan = recipes::maintenance(&config, self.mode);
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the supervisor command
#[derive(Parser, Debug, Clone)]
pub struct SupervisorArgs {
    /// Environment label
    pub label: String,

    /// start, stop or restart
    pub action: SupervisorAction,
}

impl SupervisorArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let plan = recipes::supervisor(&config, self.action);
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the deploy-workers command
#[derive(Parser, Debug, Clone)]
pub struct DeployWorkersArgs {
    /// Environment label
    pub label: String,
}

impl DeployWorkersArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let plan = recipes::deploy_workers(&config)?;
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the provision command
#[derive(Parser, Debug, Clone)]
pub struct ProvisionArgs {
    /// Environment label
    pub label: String,

    /// Role whose packages are installed
    pub role: String,
}

impl ProvisionArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        if config.packages(&self.role).is_empty() {
            ctx.output
                .warning(&format!("No packages configured for role '{}'", self.role));
        }
        let plan = recipes::provision(&config, &self.role);
        ctx.execute_plan(&config, &inventory, plan).await
    }
}

/// Arguments for the provision-worker command
#[derive(Parser, Debug, Clone)]
pub struct ProvisionWorkerArgs {
    /// Environment label
    pub label: String,
}

impl ProvisionWorkerArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (config, inventory) = ctx.load(&self.label)?;
        let plan = recipes::provision_worker(&config)?;
        ctx.execute_plan(&config, &inventory, plan).await
    }
}
