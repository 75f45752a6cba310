//! rollout - deploy a web application and its workers over SSH
//!
//! This is the main entry point for the rollout CLI.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::output::OutputFormatter;
use cli::{Cli, Commands, LogFormat};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity(), cli.log_format);

    // Display version if verbose
    if cli.verbosity() >= 2 {
        eprintln!("rollout v{}", VERSION);
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let mut ctx = CommandContext::new(&cli, cancel);

    // Execute the appropriate command
    let result = match &cli.command {
        Commands::Deploy(args) => args.execute(&mut ctx).await,
        Commands::Install(args) => args.execute(&mut ctx).await,
        Commands::BackupDatabase(args) => args.execute(&mut ctx).await,
        Commands::Maintenance(args) => args.execute(&mut ctx).await,
        Commands::Supervisor(args) => args.execute(&mut ctx).await,
        Commands::DeployWorkers(args) => args.execute(&mut ctx).await,
        Commands::Provision(args) => args.execute(&mut ctx).await,
        Commands::ProvisionWorker(args) => args.execute(&mut ctx).await,
        Commands::ListHosts(args) => args.execute(&mut ctx).await,
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => report_error(&ctx.output, &e),
    };

    std::process::exit(exit_code);
}

/// Print a command error and map it to an exit code
fn report_error(output: &OutputFormatter, error: &anyhow::Error) -> i32 {
    output.error(&format!("{:#}", error));
    error
        .downcast_ref::<rollout::Error>()
        .map(rollout::Error::exit_code)
        .unwrap_or(1)
}

/// Cancel the run on Ctrl-C; in-flight hosts finish, nothing new starts
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for running hosts to finish");
            cancel.cancel();
        }
    });
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbosity >= 3),
            )
            .with(env_filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init(),
    }
}
