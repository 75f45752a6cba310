//! Named task plans for a web application deployment.
//!
//! Every plan is assembled from a [`DeploymentConfig`]; package lists,
//! paths and commands all come from configuration. Secrets and local files
//! a plan needs are read while the plan is built, so a missing secret fails
//! the run before any host is touched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::config::DeploymentConfig;
use crate::connection::CommandSpec;
use crate::error::{Error, Result};
use crate::executor::{Overrides, Step, Task, TaskPlan};
use crate::inventory::Inventory;
use crate::settings::{render_local_settings, render_worker_config};

/// Role serving the web application
pub const WEB_ROLE: &str = "web";

/// Role running compute workers
pub const WORKER_ROLE: &str = "worker";

const BACKUP_DIR_VAR: &str = "ROLLOUT_BACKUP_DIR";

// ============================================================================
// Choices
// ============================================================================

/// What `install_mysql` sets up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MysqlChoice {
    /// Only the server
    Mysql,
    /// Only the website database and user
    WebsiteDb,
    #[default]
    All,
}

impl MysqlChoice {
    fn server(self) -> bool {
        matches!(self, MysqlChoice::Mysql | MysqlChoice::All)
    }

    fn database(self) -> bool {
        matches!(self, MysqlChoice::WebsiteDb | MysqlChoice::All)
    }
}

impl FromStr for MysqlChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(MysqlChoice::Mysql),
            "website_db" => Ok(MysqlChoice::WebsiteDb),
            "all" | "" => Ok(MysqlChoice::All),
            other => Err(format!(
                "invalid choice '{}'; valid choices are 'mysql', 'website_db' or 'all'",
                other
            )),
        }
    }
}

impl fmt::Display for MysqlChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MysqlChoice::Mysql => write!(f, "mysql"),
            MysqlChoice::WebsiteDb => write!(f, "website_db"),
            MysqlChoice::All => write!(f, "all"),
        }
    }
}

/// Supervisor action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Start,
    Stop,
    Restart,
}

impl FromStr for SupervisorAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(SupervisorAction::Start),
            "stop" => Ok(SupervisorAction::Stop),
            "restart" => Ok(SupervisorAction::Restart),
            other => Err(format!("unknown supervisor command '{}'", other)),
        }
    }
}

impl fmt::Display for SupervisorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorAction::Start => write!(f, "start"),
            SupervisorAction::Stop => write!(f, "stop"),
            SupervisorAction::Restart => write!(f, "restart"),
        }
    }
}

/// Maintenance mode transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceMode {
    Begin,
    End,
}

impl MaintenanceMode {
    fn flag(self) -> &'static str {
        match self {
            MaintenanceMode::Begin => "1",
            MaintenanceMode::End => "0",
        }
    }
}

impl FromStr for MaintenanceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "begin" => Ok(MaintenanceMode::Begin),
            "end" => Ok(MaintenanceMode::End),
            other => Err(format!(
                "invalid mode '{}'; valid values are 'begin' or 'end'",
                other
            )),
        }
    }
}

impl fmt::Display for MaintenanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceMode::Begin => write!(f, "begin"),
            MaintenanceMode::End => write!(f, "end"),
        }
    }
}

// ============================================================================
// Building blocks
// ============================================================================

/// Escape a value for a single-quoted MySQL string literal
fn sql_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Names spliced into SQL unquoted must be plain identifiers
fn sql_identifier<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(value)
    } else {
        Err(Error::Config(format!(
            "{} '{}' may only contain letters, digits, '_' or '$'",
            what, value
        )))
    }
}

fn sudo(program: &str, args: &[&str]) -> CommandSpec {
    CommandSpec::new(program).args(args.iter().copied()).sudo()
}

/// Checkout directory, with the virtualenv active
fn checkout_scope(config: &DeploymentConfig) -> Overrides {
    with_virtualenv(config, Overrides::new().cwd(config.environment.deploy_dir.clone()))
}

/// Application directory, with the virtualenv active
fn app_scope(config: &DeploymentConfig) -> Overrides {
    with_virtualenv(config, Overrides::new().cwd(config.app_dir()))
}

fn with_virtualenv(config: &DeploymentConfig, overrides: Overrides) -> Overrides {
    match &config.environment.virtualenv {
        Some(venv) => overrides.prefix(CommandSpec::shell(format!(
            ". {}/bin/activate",
            crate::connection::quote_path(venv)
        ))),
        None => overrides,
    }
}

fn provision_task(config: &DeploymentConfig, role: &str) -> Task {
    let mut commands = vec![
        sudo("apt-get", &["update"]),
        sudo("apt-get", &["-y", "upgrade"]),
    ];
    let packages = config.packages(role);
    if !packages.is_empty() {
        commands.push(
            CommandSpec::new("apt-get")
                .args(["-y", "install"])
                .args(packages.iter().cloned())
                .sudo(),
        );
    }
    Task::script("provision_packages", commands)
}

fn ensure_repository_task(config: &DeploymentConfig) -> Result<Task> {
    let repository = config.environment.repository.as_deref().ok_or_else(|| {
        Error::Config(format!(
            "environment '{}' has no repository to clone",
            config.label()
        ))
    })?;
    let dest = crate::connection::quote_path(&config.environment.deploy_dir);
    Ok(Task::script(
        "ensure_repository",
        vec![CommandSpec::shell(format!(
            "[ -e {dest} ] || git clone {} {dest}",
            shell_words::quote(repository)
        ))],
    ))
}

fn checkout_task(config: &DeploymentConfig, pull: bool) -> Task {
    let mut commands = Vec::new();
    if pull {
        commands.push(CommandSpec::new("git").arg("pull"));
    }
    commands.push(CommandSpec::new("git").args(["checkout", config.git_tag()]));
    commands.push(CommandSpec::new(config.environment.setup_script.clone()));
    Task::script("checkout", commands)
}

fn nginx_restart_step() -> Step {
    Step::on_role(
        Task::script(
            "nginx_restart",
            vec![sudo("/etc/init.d/nginx", &["restart"])],
        ),
        WEB_ROLE,
    )
}

// ============================================================================
// Plans
// ============================================================================

/// Install the packages configured for `role`
pub fn provision(config: &DeploymentConfig, role: &str) -> TaskPlan {
    TaskPlan::new(format!("provision {}", role))
        .step(Step::on_role(provision_task(config, role), role).max_attempts(2))
}

/// Install MySQL on the single web host.
///
/// Fails with [`Error::Cardinality`] unless exactly one web host is
/// configured, and with [`Error::MissingSecret`] when a password is missing.
pub fn install_mysql(
    config: &DeploymentConfig,
    inventory: &Inventory,
    choice: MysqlChoice,
) -> Result<TaskPlan> {
    let host = inventory.require_single(WEB_ROLE)?;
    let db = &config.environment.database;
    let admin_password = config.secret(&db.admin_password)?;

    let mut commands = Vec::new();
    if choice.server() {
        commands.push(sudo(
            "env",
            &["DEBIAN_FRONTEND=noninteractive", "apt-get", "install", "-y", "mysql-server"],
        ));
        commands.push(sudo("mysqladmin", &["-u", "root", "password", admin_password.as_str()]));
    }
    if choice.database() {
        let name = sql_identifier("database name", &db.name)?;
        let user = sql_identifier("database user", &db.user)?;
        let password = sql_string(&config.secret(&db.password)?);
        let sql = format!(
            "create database {name}; \
             create user '{user}'@'localhost' IDENTIFIED BY '{password}'; \
             GRANT ALL PRIVILEGES ON {name}.* TO '{user}'@'localhost' WITH GRANT OPTION;",
        );
        commands.push(CommandSpec::new("mysql").args([
            "--user=root".to_string(),
            format!("--password={}", admin_password),
            format!("--execute={}", sql),
        ]));
    }

    let task = Task::script("install_mysql", commands)
        .destructive()
        .requires_role(WEB_ROLE);
    Ok(TaskPlan::new(format!("install_mysql {}", choice)).step(Step::on_hosts(task, vec![host])))
}

/// Start, stop or restart supervisor on the web hosts
pub fn supervisor(config: &DeploymentConfig, action: SupervisorAction) -> TaskPlan {
    TaskPlan::new(format!("supervisor {}", action)).step(supervisor_step(config, action))
}

fn supervisor_step(config: &DeploymentConfig, action: SupervisorAction) -> Step {
    let conf = config.environment.supervisor_conf.clone();
    let commands = match action {
        SupervisorAction::Start => vec![
            CommandSpec::new("mkdir").args(["-p", "~/logs"]),
            CommandSpec::new("supervisord").args(["-c", conf.as_str()]),
        ],
        SupervisorAction::Stop => vec![
            CommandSpec::new("supervisorctl").args(["-c", conf.as_str(), "stop", "all"]),
            CommandSpec::new("supervisorctl").args(["-c", conf.as_str(), "shutdown"]),
            // Workers are multi-threaded and survive the shutdown.
            CommandSpec::new("pkill")
                .args(["-9", "-f", config.environment.worker_kill_pattern.as_str()])
                .allow_failure(),
        ],
        SupervisorAction::Restart => vec![
            CommandSpec::new("supervisorctl").args(["-c", conf.as_str(), "restart", "all"]),
        ],
    };
    Step::on_role(
        Task::script(format!("supervisor_{}", action), commands),
        WEB_ROLE,
    )
    .with_overrides(app_scope(config))
}

/// Switch maintenance mode, regenerate configuration, restart nginx
pub fn maintenance(config: &DeploymentConfig, mode: MaintenanceMode) -> TaskPlan {
    let mut plan = TaskPlan::new(format!("maintenance {}", mode));
    plan.steps = maintenance_steps(config, mode);
    plan
}

fn maintenance_steps(config: &DeploymentConfig, mode: MaintenanceMode) -> Vec<Step> {
    let regenerate = Task::script(
        format!("maintenance_{}", mode),
        vec![CommandSpec::shell(config.environment.config_gen_command.clone())],
    );
    vec![
        Step::on_role(regenerate, WEB_ROLE)
            .with_overrides(app_scope(config).env("MAINTENANCE_MODE", mode.flag())),
        nginx_restart_step(),
    ]
}

/// Update the checkout, push settings, regenerate configuration and
/// install certificates
fn deploy_steps(config: &DeploymentConfig) -> Result<Vec<Step>> {
    let settings_path = format!(
        "{}/{}",
        config.environment.deploy_dir.trim_end_matches('/'),
        config.environment.settings_file
    );
    let local_settings = render_local_settings(config)?;

    let mut configure = vec![CommandSpec::shell(config.environment.config_gen_command.clone())];
    configure.extend(
        config
            .environment
            .deploy_commands
            .iter()
            .map(|line| CommandSpec::shell(line.clone())),
    );
    let service = config
        .environment
        .service_name
        .clone()
        .unwrap_or_else(|| "rollout".to_string());
    configure.push(
        CommandSpec::shell(format!(
            "ln -sf \"$(pwd)/config/generated/nginx.conf\" /etc/nginx/sites-enabled/{}.conf",
            service
        ))
        .sudo(),
    );
    configure.push(
        CommandSpec::shell(format!(
            "ln -sf \"$(pwd)/config/generated/supervisor.conf\" /etc/supervisor/conf.d/{}.conf",
            service
        ))
        .sudo(),
    );

    let mut steps = vec![
        Step::on_role(checkout_task(config, true), WEB_ROLE)
            .with_overrides(checkout_scope(config)),
        Step::on_role(
            Task::upload("upload_local_settings", local_settings, settings_path, false),
            WEB_ROLE,
        ),
        Step::on_role(Task::script("configure_application", configure), WEB_ROLE)
            .with_overrides(app_scope(config)),
    ];

    steps.extend(certificate_steps(config)?);
    Ok(steps)
}

fn certificate_steps(config: &DeploymentConfig) -> Result<Vec<Step>> {
    let pairs = [
        ("ssl_certificate", "ssl_certificate_installed"),
        ("ssl_certificate_key", "ssl_certificate_key_installed"),
    ];

    let mut resolved = Vec::new();
    for (local, installed) in pairs {
        match (config.path_named(local)?, config.path_named(installed)?) {
            (Some(local), Some(installed)) => resolved.push((local, installed)),
            _ => {
                info!("Skipping certificate installation because both files are not specified");
                return Ok(Vec::new());
            }
        }
    }

    resolved
        .into_iter()
        .map(|(local, installed)| {
            let content = std::fs::read(&local)?;
            let name = format!(
                "install_{}",
                local
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "certificate".to_string())
            );
            Ok(Step::on_role(
                Task::upload(name, content, installed.to_string_lossy().to_string(), true),
                WEB_ROLE,
            ))
        })
        .collect()
}

/// Deploy the web application behind a maintenance page.
///
/// Supervisor is started again and maintenance mode is ended by cleanup
/// steps that run even when the deployment fails.
pub fn deploy(config: &DeploymentConfig) -> Result<TaskPlan> {
    let mut plan = TaskPlan::new("deploy");
    plan.steps.extend(maintenance_steps(config, MaintenanceMode::Begin));
    plan.steps.push(supervisor_step(config, SupervisorAction::Stop));
    plan.steps.extend(deploy_steps(config)?);
    plan.steps
        .push(supervisor_step(config, SupervisorAction::Start).always_run());
    plan.steps.extend(
        maintenance_steps(config, MaintenanceMode::End)
            .into_iter()
            .map(Step::always_run),
    );
    Ok(plan)
}

/// Install the web host from scratch
pub fn install(
    config: &DeploymentConfig,
    inventory: &Inventory,
    choice: MysqlChoice,
) -> Result<TaskPlan> {
    let mut plan = provision(config, WEB_ROLE);
    plan.name = "install".to_string();
    plan.steps.push(Step::on_role(ensure_repository_task(config)?, WEB_ROLE));
    plan.steps.push(
        Step::on_role(checkout_task(config, false), WEB_ROLE)
            .with_overrides(checkout_scope(config)),
    );
    plan.steps.extend(install_mysql(config, inventory, choice)?.steps);
    plan.steps.extend(deploy_steps(config)?);
    plan.steps.push(nginx_restart_step());
    plan.steps
        .push(supervisor_step(config, SupervisorAction::Stop).best_effort());
    plan.steps.push(supervisor_step(config, SupervisorAction::Start));
    Ok(plan)
}

/// Deploy or update the compute workers
pub fn deploy_workers(config: &DeploymentConfig) -> Result<TaskPlan> {
    let service = config.environment.worker_service.clone();
    let mut plan = TaskPlan::new("deploy_workers")
        .step(Step::on_role(
            Task::upload(
                "upload_worker_config",
                render_worker_config(config)?,
                config.environment.worker_config_file.clone(),
                false,
            ),
            WORKER_ROLE,
        ))
        .step(
            Step::on_role(checkout_task(config, true), WORKER_ROLE)
                .with_overrides(checkout_scope(config)),
        );

    match config.path_named("worker_service_definition")? {
        Some(local) => {
            let content = std::fs::read(&local)?;
            plan = plan.step(Step::on_role(
                Task::upload(
                    "upload_worker_service",
                    content,
                    format!("/etc/init/{}.conf", service),
                    true,
                ),
                WORKER_ROLE,
            ));
        }
        None => info!("No worker service definition configured; keeping the installed one"),
    }

    Ok(plan
        .step(
            Step::on_role(
                Task::script("worker_stop", vec![sudo("stop", &[service.as_str()])]),
                WORKER_ROLE,
            )
            .best_effort(),
        )
        .step(
            Step::on_role(
                Task::script("worker_start", vec![sudo("start", &[service.as_str()])]),
                WORKER_ROLE,
            )
            .best_effort(),
        ))
}

/// Install compute workers from scratch: packages, a clone of the
/// repository, then a full worker deployment
pub fn provision_worker(config: &DeploymentConfig) -> Result<TaskPlan> {
    let mut plan = provision(config, WORKER_ROLE);
    plan.name = "provision_worker".to_string();
    plan.steps
        .push(Step::on_role(ensure_repository_task(config)?, WORKER_ROLE));
    plan.steps.extend(deploy_workers(config)?.steps);
    Ok(plan)
}

/// Directory backups are downloaded to
pub fn backup_dir(config: &DeploymentConfig, explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var(BACKUP_DIR_VAR) {
        return Ok(PathBuf::from(dir));
    }
    Ok(config
        .path_named("backup_dir")?
        .unwrap_or_else(|| PathBuf::from(".")))
}

/// Dump the website database on the single web host and download it
pub fn backup_database(
    config: &DeploymentConfig,
    inventory: &Inventory,
    dest: &Path,
) -> Result<TaskPlan> {
    let host = inventory.require_single(WEB_ROLE)?;
    let db = &config.environment.database;
    let password = config.secret(&db.password)?;

    let file_name = format!(
        "competitiondump-{}.sql.gz",
        chrono::Local::now().format("%Y-%m-%d-%H-%M-%S")
    );
    let remote = format!("/tmp/{}", file_name);
    let dump = CommandSpec::shell(format!(
        "mysqldump --host=localhost --user={} --password={} {} --port=3306 | gzip > {}",
        shell_words::quote(&db.user),
        shell_words::quote(&password),
        shell_words::quote(&db.name),
        remote
    ));
    let local = dest.join(&file_name);

    let task = Task::from_fn("backup_database", move |ctx| {
        let dump = dump.clone();
        let remote = remote.clone();
        let local = local.clone();
        Box::pin(async move {
            ctx.run(&dump).await?;
            let content = ctx.get(&remote).await?;
            ctx.run(&CommandSpec::new("rm").args(["-f", remote.as_str()]))
                .await?;
            if !ctx.is_dry_run() {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&local, &content).await?;
                ctx.log(format!(
                    "saved {} bytes to {}",
                    content.len(),
                    local.display()
                ));
            }
            Ok(ctx.success())
        })
    })
    .requires_role(WEB_ROLE);

    Ok(TaskPlan::new("backup_database").step(Step::on_hosts(task, vec![host])))
}
