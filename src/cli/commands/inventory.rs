//! Inventory commands
//!
//! This module implements the `list-hosts` subcommand.

use anyhow::Result;
use clap::Parser;

use super::CommandContext;

/// Arguments for list-hosts command
#[derive(Parser, Debug, Clone)]
pub struct ListHostsArgs {
    /// Environment label
    pub label: String,

    /// Only list the hosts of this role
    pub role: Option<String>,
}

impl ListHostsArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let (_, inventory) = ctx.load(&self.label)?;
        if inventory.host_count() == 0 {
            ctx.output
                .warning(&format!("Environment '{}' has no hosts", self.label));
            return Ok(0);
        }
        ctx.output.hosts(&inventory, self.role.as_deref())?;
        Ok(0)
    }
}
