//! Configuration module for Rollout
//!
//! A deployment file describes one or more labelled environments (`prod`,
//! `test`, ...). Loading selects one of them and resolves it against the
//! shared defaults:
//! - Default values
//! - The `[defaults]` table of the file
//! - The `[environments.<label>]` table
//! - Environment variables (`ROLLOUT_*`)
//! - Command-line arguments (applied by the binary)

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::connection::is_valid_env_name;
use crate::error::{Error, Result};
use crate::executor::{RunOptions, DEFAULT_COMMAND_TIMEOUT, DEFAULT_FAN_OUT};
use crate::inventory::host::DEFAULT_SSH_PORT;
use crate::inventory::{Host, Inventory, Transport};

/// Prefix marking a secret read from the process environment
const ENV_SECRET_PREFIX: &str = "env:";

/// Shared connection and execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Login user for hosts that don't name one
    pub user: Option<String>,

    /// SSH port for hosts that don't name one
    pub port: u16,

    /// Private key for authentication
    pub private_key: Option<String>,

    /// Login password, or `env:NAME`
    pub password: Option<String>,

    /// Number of hosts a step runs on concurrently
    pub forks: usize,

    /// Per-command timeout
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            user: None,
            port: DEFAULT_SSH_PORT,
            private_key: None,
            password: None,
            forks: DEFAULT_FAN_OUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect_timeout: 30,
        }
    }
}

/// A host in a role: either `[user@]address[:port]` or a table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HostEntry {
    Spec(String),
    Table(HostTable),
}

/// Table form of a host entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostTable {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub transport: Transport,
}

/// Database names; passwords are secret names, not values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    /// Secret holding the application user's password
    pub password: String,
    /// Secret holding the administrator password
    pub admin_password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "website".to_string(),
            user: "website".to_string(),
            password: "database_password".to_string(),
            admin_password: "database_admin_password".to_string(),
        }
    }
}

/// One labelled environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    /// Role name to hosts
    pub roles: IndexMap<String, Vec<HostEntry>>,

    /// Named secrets; `env:NAME` values are read at resolve time
    pub secrets: IndexMap<String, String>,

    /// Revision deployed
    pub git_tag: String,

    /// Repository cloned on install
    pub repository: Option<String>,

    /// Checkout directory on the hosts
    pub deploy_dir: String,

    /// Directory inside the checkout where management commands run
    pub app_dir: Option<String>,

    /// Virtualenv activated before application commands
    pub virtualenv: Option<String>,

    /// Script run after every checkout
    pub setup_script: String,

    /// Service name; the server name defaults to `<service>.cloudapp.net`
    pub service_name: Option<String>,

    pub server_name: Option<String>,

    /// Application configuration flavour (e.g. `Prod`, `Dev`)
    pub configuration: String,

    pub http_port: u16,

    /// Feature switches
    pub toggles: IndexMap<String, bool>,

    /// Named local or remote paths
    pub paths: IndexMap<String, String>,

    /// Extra environment for every task
    pub shell_env: IndexMap<String, String>,

    /// Role name to packages installed by `provision`
    pub packages: IndexMap<String, Vec<String>>,

    pub database: DatabaseConfig,

    /// Template for the generated local settings file
    pub settings_template: Option<String>,

    /// Where the local settings file goes, relative to the deploy directory
    pub settings_file: String,

    /// Extra values exposed to the settings template
    pub settings: IndexMap<String, serde_json::Value>,

    /// Commands run in the application directory on every deploy
    pub deploy_commands: Vec<String>,

    /// Command regenerating service configuration
    pub config_gen_command: String,

    /// Supervisor configuration, relative to the application directory
    pub supervisor_conf: String,

    /// Pattern of leftover worker processes killed on supervisor stop
    pub worker_kill_pattern: String,

    /// Upstart job name of the compute worker
    pub worker_service: String,

    /// Where the worker configuration file is written on workers
    pub worker_config_file: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            roles: IndexMap::new(),
            secrets: IndexMap::new(),
            git_tag: "master".to_string(),
            repository: None,
            deploy_dir: "app".to_string(),
            app_dir: None,
            virtualenv: None,
            setup_script: "./dev_setup.sh".to_string(),
            service_name: None,
            server_name: None,
            configuration: "Prod".to_string(),
            http_port: 80,
            toggles: IndexMap::new(),
            paths: IndexMap::new(),
            shell_env: IndexMap::new(),
            packages: IndexMap::new(),
            database: DatabaseConfig::default(),
            settings_template: None,
            settings_file: "local_settings.py".to_string(),
            settings: IndexMap::new(),
            deploy_commands: Vec::new(),
            config_gen_command: "python manage.py config_gen".to_string(),
            supervisor_conf: "config/generated/supervisor.conf".to_string(),
            worker_kill_pattern: "worker.py".to_string(),
            worker_service: "rollout-worker".to_string(),
            worker_config_file: "~/.workerconfig".to_string(),
        }
    }
}

/// On-disk file shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    defaults: Defaults,
    environments: IndexMap<String, Environment>,
}

/// A resolved deployment configuration for one label
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    label: String,
    path: PathBuf,
    /// Shared defaults after environment overrides
    pub defaults: Defaults,
    /// The selected environment
    pub environment: Environment,
}

impl DeploymentConfig {
    /// Load `path` and select the environment labelled `label`
    pub fn load(path: impl AsRef<Path>, label: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content, path, label)?;
        config.apply_env_overrides();
        debug!(path = %path.display(), label = %label, "Loaded deployment configuration");
        Ok(config)
    }

    /// Parse configuration text; the format follows the extension of `path`
    pub fn parse(content: &str, path: impl AsRef<Path>, label: &str) -> Result<Self> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let file: ConfigFile = match extension {
            "yml" | "yaml" => serde_yaml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            "toml" => toml::from_str(content)?,
            _ => match toml::from_str(content) {
                Ok(file) => file,
                Err(_) => serde_yaml::from_str(content)?,
            },
        };

        let ConfigFile {
            defaults,
            mut environments,
        } = file;

        let environment = environments.shift_remove(label).ok_or_else(|| {
            let available: Vec<_> = environments.keys().map(String::as_str).collect();
            Error::Config(format!(
                "unknown environment '{}' (available: {})",
                label,
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            ))
        })?;

        if let Some(key) = environment
            .shell_env
            .keys()
            .find(|key| !is_valid_env_name(key))
        {
            return Err(Error::Config(format!(
                "invalid shell_env name '{}' in environment '{}'",
                key, label
            )));
        }

        Ok(Self {
            label: label.to_string(),
            path: path.to_path_buf(),
            defaults,
            environment,
        })
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // ROLLOUT_FORKS
        if let Ok(forks) = std::env::var("ROLLOUT_FORKS") {
            if let Ok(n) = forks.parse() {
                self.defaults.forks = n;
            }
        }

        // ROLLOUT_TIMEOUT
        if let Ok(timeout) = std::env::var("ROLLOUT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.defaults.command_timeout = Duration::from_secs(secs);
            }
        }

        // ROLLOUT_REMOTE_USER
        if let Ok(user) = std::env::var("ROLLOUT_REMOTE_USER") {
            self.defaults.user = Some(user);
        }

        // ROLLOUT_PRIVATE_KEY_FILE
        if let Ok(file) = std::env::var("ROLLOUT_PRIVATE_KEY_FILE") {
            self.defaults.private_key = Some(file);
        }
    }

    /// Environment label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// File the configuration came from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Revision deployed
    pub fn git_tag(&self) -> &str {
        &self.environment.git_tag
    }

    /// Public server name
    pub fn server_name(&self) -> String {
        match (&self.environment.server_name, &self.environment.service_name) {
            (Some(name), _) => name.clone(),
            (None, Some(service)) => format!("{}.cloudapp.net", service),
            (None, None) => "localhost".to_string(),
        }
    }

    /// Look up a secret, reading `env:NAME` values from the environment
    pub fn secret(&self, name: &str) -> Result<String> {
        let value = self
            .environment
            .secrets
            .get(name)
            .ok_or_else(|| Error::MissingSecret(name.to_string()))?;
        resolve_value(value).ok_or_else(|| Error::MissingSecret(name.to_string()))
    }

    /// Feature switch; unset switches are off
    pub fn toggle(&self, name: &str) -> bool {
        self.environment.toggles.get(name).copied().unwrap_or(false)
    }

    /// Named path with `~` and `$VAR` expanded
    pub fn path_named(&self, name: &str) -> Result<Option<PathBuf>> {
        match self.environment.paths.get(name) {
            Some(raw) => expand(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Packages `provision` installs for `role`
    pub fn packages(&self, role: &str) -> &[String] {
        self.environment
            .packages
            .get(role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Directory where management commands run
    pub fn app_dir(&self) -> String {
        match &self.environment.app_dir {
            Some(dir) => format!("{}/{}", self.environment.deploy_dir.trim_end_matches('/'), dir),
            None => self.environment.deploy_dir.clone(),
        }
    }

    /// Base environment for every task
    pub fn shell_env(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        env.insert(
            "APP_CONFIGURATION".to_string(),
            self.environment.configuration.clone(),
        );
        env.insert(
            "CONFIG_HTTP_PORT".to_string(),
            self.environment.http_port.to_string(),
        );
        env.insert("CONFIG_SERVER_NAME".to_string(), self.server_name());
        for (key, value) in &self.environment.shell_env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.connect_timeout)
    }

    /// Run options derived from the defaults
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_fan_out: self.defaults.forks.max(1),
            command_timeout: Some(self.defaults.command_timeout),
            base_env: self.shell_env(),
            ..RunOptions::default()
        }
    }

    /// Build the role to host mapping
    pub fn inventory(&self) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        for (role, entries) in &self.environment.roles {
            inventory.declare_role(role.clone());
            for entry in entries {
                let host = self.build_host(entry)?;
                inventory.add(role.clone(), host);
            }
        }
        Ok(inventory)
    }

    fn build_host(&self, entry: &HostEntry) -> Result<Host> {
        let mut host = match entry {
            HostEntry::Spec(spec) => {
                let mut host = Host::parse(spec)
                    .map_err(|e| Error::Config(format!("invalid host '{}': {}", spec, e)))?;
                if !spec.contains('@') {
                    if let Some(user) = &self.defaults.user {
                        host.user = user.clone();
                    }
                }
                if !spec.contains(':') {
                    host.port = self.defaults.port;
                }
                host
            }
            HostEntry::Table(table) => {
                if table.address.trim().is_empty() {
                    return Err(Error::Config("host entry with empty address".to_string()));
                }
                let mut host = Host::new(table.name.clone().unwrap_or_else(|| table.address.clone()));
                host.address = table.address.clone();
                host.port = table.port.unwrap_or(self.defaults.port);
                if let Some(user) = table.user.as_ref().or(self.defaults.user.as_ref()) {
                    host.user = user.clone();
                }
                if let Some(key) = &table.private_key {
                    host.private_key = Some(expand(key)?);
                }
                host.transport = table.transport;
                host
            }
        };

        if host.private_key.is_none() {
            if let Some(key) = &self.defaults.private_key {
                host.private_key = Some(expand(key)?);
            }
        }
        if let Some(password) = &self.defaults.password {
            host.password = resolve_value(password);
        }
        Ok(host)
    }
}

/// Resolve a literal or `env:NAME` value
fn resolve_value(value: &str) -> Option<String> {
    match value.strip_prefix(ENV_SECRET_PREFIX) {
        Some(var) => std::env::var(var).ok(),
        None => Some(value.to_string()),
    }
}

pub(crate) fn expand(raw: &str) -> Result<PathBuf> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| Error::Config(format!("cannot expand path '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
user = "deploy"
forks = 3
command_timeout = "2m"

[environments.prod]
git_tag = "v1.4.0"
service_name = "competitions"
roles.web = ["web1.example.org", "admin@web2.example.org:2222"]
roles.worker = [{ address = "10.0.0.7", name = "worker1", port = 2200 }]
secrets.database_password = "hunter2"
toggles.maintenance = true
packages.web = ["nginx", "supervisor"]

[environments.test]
roles.web = ["test-web"]
"#;

    fn prod() -> DeploymentConfig {
        DeploymentConfig::parse(SAMPLE, "deploy.toml", "prod").unwrap()
    }

    #[test]
    fn test_parse_selects_label() {
        let config = prod();
        assert_eq!(config.label(), "prod");
        assert_eq!(config.git_tag(), "v1.4.0");
        assert_eq!(config.server_name(), "competitions.cloudapp.net");
        assert_eq!(config.defaults.command_timeout, Duration::from_secs(120));
        assert!(config.toggle("maintenance"));
        assert!(!config.toggle("debug"));
        assert_eq!(config.packages("web"), ["nginx", "supervisor"]);
        assert!(config.packages("worker").is_empty());
    }

    #[test]
    fn test_unknown_label_lists_available() {
        let err = DeploymentConfig::parse(SAMPLE, "deploy.toml", "staging").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("staging"));
        assert!(message.contains("prod, test"));
        assert!(err.is_resolution());
    }

    #[test]
    fn test_inventory_applies_defaults() {
        let inventory = prod().inventory().unwrap();
        let web = inventory.resolve("web").unwrap();
        assert_eq!(web[0].user, "deploy");
        assert_eq!(web[0].port, 22);
        assert_eq!(web[1].user, "admin");
        assert_eq!(web[1].port, 2222);

        let worker = inventory.require_single("worker").unwrap();
        assert_eq!(worker.name, "worker1");
        assert_eq!(worker.address, "10.0.0.7");
        assert_eq!(worker.port, 2200);
        assert_eq!(worker.user, "deploy");
    }

    #[test]
    fn test_secrets() {
        let mut config = prod();
        assert_eq!(config.secret("database_password").unwrap(), "hunter2");
        assert!(matches!(
            config.secret("newrelic_key"),
            Err(Error::MissingSecret(name)) if name == "newrelic_key"
        ));

        config
            .environment
            .secrets
            .insert("unset".into(), "env:ROLLOUT_TEST_SURELY_UNSET_VAR".into());
        assert!(matches!(config.secret("unset"), Err(Error::MissingSecret(_))));
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
environments:
  dev:
    roles:
      web:
        - address: localhost
          transport: local
"#;
        let config = DeploymentConfig::parse(yaml, "deploy.yaml", "dev").unwrap();
        let host = config.inventory().unwrap().require_single("web").unwrap();
        assert_eq!(host.transport, Transport::Local);
        assert_eq!(config.defaults.forks, DEFAULT_FAN_OUT);
    }

    #[test]
    fn test_run_options_and_shell_env() {
        let config = prod();
        let options = config.run_options();
        assert_eq!(options.max_fan_out, 3);
        assert_eq!(options.command_timeout, Some(Duration::from_secs(120)));
        assert_eq!(
            options.base_env.get("CONFIG_SERVER_NAME").map(String::as_str),
            Some("competitions.cloudapp.net")
        );
        assert!(!options.dry_run);
    }

    #[test]
    fn test_shell_env_names_checked_at_load() {
        let content = "[environments.prod]\nroles.web = [\"web1\"]\nshell_env = { \"A;rm -rf ~\" = \"1\" }\n";
        let err = DeploymentConfig::parse(content, "deploy.toml", "prod").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("A;rm -rf ~")));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("ROLLOUT_REMOTE_USER", "ops");
        let mut config = prod();
        config.apply_env_overrides();
        assert_eq!(config.defaults.user.as_deref(), Some("ops"));
        std::env::remove_var("ROLLOUT_REMOTE_USER");
    }

    #[test]
    fn test_path_expansion() {
        let mut config = prod();
        config
            .environment
            .paths
            .insert("cert".into(), "/etc/ssl/$ROLLOUT_TEST_MISSING_VAR".into());
        assert!(config.path_named("cert").is_err());
        assert!(config.path_named("nothing").unwrap().is_none());
    }
}
