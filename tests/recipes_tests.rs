//! End-to-end tests for the deployment plans against mock hosts

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rollout::callback::NullSink;
use rollout::config::DeploymentConfig;
use rollout::connection::{ConnectionPool, Connector};
use rollout::executor::{RunStatus, Runner, TaskStatus};
use rollout::recipes::{self, MysqlChoice, SupervisorAction};
use rollout::Error;

use common::*;

const CONFIG: &str = r#"
[defaults]
user = "deploy"
forks = 4

[environments.prod]
git_tag = "v3"
repository = "https://example.org/app.git"
deploy_dir = "site"
app_dir = "app"
virtualenv = "~/venv"
service_name = "contest"
roles.web = ["web1"]
roles.worker = ["w1", "w2"]
secrets.database_password = "pw"
secrets.database_admin_password = "root-pw"
settings.worker = { queue = "compute" }
"#;

fn setup() -> (DeploymentConfig, Arc<MockConnector>, Runner) {
    let config = DeploymentConfig::parse(CONFIG, "deploy.toml", "prod").unwrap();
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(Arc::clone(&connector) as Arc<dyn Connector>);
    let runner = Runner::new(pool, Arc::new(NullSink));
    (config, connector, runner)
}

// ============================================================================
// deploy
// ============================================================================

#[tokio::test]
async fn test_deploy_runs_behind_maintenance_page() {
    let (config, connector, runner) = setup();
    let inventory = config.inventory().unwrap();
    let plan = recipes::deploy(&config).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);

    let web1 = connector.host("web1");
    let commands = web1.commands();
    assert!(commands[0].starts_with("export APP_CONFIGURATION=Prod; "));
    assert!(commands[0].contains("export MAINTENANCE_MODE=1; cd site/app && "));
    assert!(commands[0].ends_with("python manage.py config_gen"));

    let end = &commands[commands.len() - 2];
    assert!(end.contains("export MAINTENANCE_MODE=0;"));
    assert!(commands
        .iter()
        .any(|c| c.contains("cd site && . ~/venv/bin/activate && git checkout v3")));

    let settings = String::from_utf8(web1.file("site/local_settings.py").unwrap()).unwrap();
    assert!(settings.contains(r#"'PASSWORD': "pw","#));
    assert!(settings.contains("'prod' environment (v3)"));

    // Workers are untouched by a web deploy
    assert!(connector.host("w1").commands().is_empty());
}

#[tokio::test]
async fn test_failed_deploy_still_ends_maintenance() {
    let (config, connector, runner) = setup();
    connector.on("web1", "git checkout", Reply::Exit(1, "unknown revision".into()));
    let inventory = config.inventory().unwrap();
    let plan = recipes::deploy(&config).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.first_failure().unwrap().task, "checkout");
    assert!(!report.ran("upload_local_settings"));
    for cleanup in ["supervisor_start", "maintenance_end"] {
        assert!(report.ran(cleanup));
        assert!(report
            .outcomes_for(cleanup)
            .all(|e| e.outcome.status == TaskStatus::Success));
    }
    assert!(connector
        .host("web1")
        .commands()
        .last()
        .unwrap()
        .contains("/etc/init.d/nginx restart"));
}

#[tokio::test]
async fn test_deploy_dry_run_touches_nothing() {
    let (config, connector, runner) = setup();
    let inventory = config.inventory().unwrap();
    let plan = recipes::deploy(&config).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options().dry_run(true))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(connector.total_connects(), 0);
    let upload = report.outcomes_for("upload_local_settings").next().unwrap();
    assert!(upload.outcome.output.starts_with("[dry-run] put "));
    assert!(upload.outcome.output.contains("site/local_settings.py"));
}

// ============================================================================
// supervisor / workers
// ============================================================================

#[tokio::test]
async fn test_supervisor_stop_tolerates_missing_workers() {
    let (config, connector, runner) = setup();
    connector.on("web1", "pkill", Reply::Exit(1, String::new()));
    let inventory = config.inventory().unwrap();
    let plan = recipes::supervisor(&config, SupervisorAction::Stop);

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_worker_restart_failures_are_partial() {
    let (config, connector, runner) = setup();
    connector.on("w2", "sudo -n -- sh -c 'export", Reply::Exit(1, "unknown job".into()));
    let inventory = config.inventory().unwrap();
    let plan = recipes::deploy_workers(&config).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(report.exit_code(), 0);
    let failed: Vec<_> = report
        .entries
        .iter()
        .filter(|e| e.outcome.is_failure())
        .map(|e| (e.host.as_str(), e.task.as_str()))
        .collect();
    assert_eq!(failed, vec![("w2", "worker_stop"), ("w2", "worker_start")]);

    let worker_config = connector.host("w1").file("~/.workerconfig").unwrap();
    let worker_config = String::from_utf8(worker_config).unwrap();
    assert!(worker_config.contains("queue: compute"));
}

// ============================================================================
// single-host commands
// ============================================================================

#[test]
fn test_mysql_requires_exactly_one_web_host() {
    let config = DeploymentConfig::parse(
        &CONFIG.replace(r#"roles.web = ["web1"]"#, r#"roles.web = ["web1", "web2"]"#),
        "deploy.toml",
        "prod",
    )
    .unwrap();
    let inventory = config.inventory().unwrap();

    let result = recipes::install(&config, &inventory, MysqlChoice::All);
    assert!(matches!(result, Err(Error::Cardinality { found: 2, .. })));
    assert!(matches!(
        recipes::backup_database(&config, &inventory, std::path::Path::new(".")),
        Err(Error::Cardinality { .. })
    ));
}

#[tokio::test]
async fn test_mysql_password_is_escaped() {
    let config = DeploymentConfig::parse(
        &CONFIG.replace(
            r#"secrets.database_password = "pw""#,
            r#"secrets.database_password = "it's\\""#,
        ),
        "deploy.toml",
        "prod",
    )
    .unwrap();
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(Arc::clone(&connector) as Arc<dyn Connector>);
    let runner = Runner::new(pool, Arc::new(NullSink));
    let inventory = config.inventory().unwrap();
    let plan = recipes::install_mysql(&config, &inventory, MysqlChoice::WebsiteDb).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let commands = connector.host("web1").commands();
    let argv = shell_words::split(commands.last().unwrap()).unwrap();
    let sql = argv
        .iter()
        .find_map(|arg| arg.strip_prefix("--execute="))
        .unwrap();
    assert!(sql.contains(r#"IDENTIFIED BY 'it\'s\\';"#));
}

#[tokio::test]
async fn test_provision_worker_clones_then_deploys() {
    let (config, connector, runner) = setup();
    let inventory = config.inventory().unwrap();
    let plan = recipes::provision_worker(&config).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    for host in ["w1", "w2"] {
        let commands = connector.host(host).commands();
        let clone = commands
            .iter()
            .position(|c| c.contains("git clone"))
            .unwrap();
        let checkout = commands
            .iter()
            .position(|c| c.contains("git checkout v3"))
            .unwrap();
        assert!(clone < checkout);
        assert!(connector.host(host).file("~/.workerconfig").is_some());
    }
    assert!(connector.host("web1").commands().is_empty());
}

#[tokio::test]
async fn test_backup_dry_run_writes_nothing_locally() {
    let (config, connector, runner) = setup();
    let inventory = config.inventory().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let plan = recipes::backup_database(&config, &inventory, dest.path()).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options().dry_run(true))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let output = &report.entries[0].outcome.output;
    assert!(output.contains("mysqldump"));
    assert!(output.contains("[dry-run] get /tmp/competitiondump-"));
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    assert_eq!(connector.total_connects(), 0);
}

#[tokio::test]
async fn test_backup_fails_when_dump_is_missing() {
    let (config, _connector, runner) = setup();
    let inventory = config.inventory().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let plan = recipes::backup_database(&config, &inventory, dest.path()).unwrap();

    let report = runner
        .run(&plan, &inventory, &config.run_options())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    let error = report.first_failure().unwrap().outcome.error.clone().unwrap();
    assert!(error.contains("File transfer failed"));
}
