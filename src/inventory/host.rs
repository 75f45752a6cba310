//! Host definition.
//!
//! A [`Host`] is a deployment target with its connection parameters and the
//! set of roles it was resolved under. Hosts are immutable once a run starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// How a host is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// SSH connection (default)
    #[default]
    Ssh,
    /// Local execution on the control node
    Local,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Ssh => write!(f, "ssh"),
            Transport::Local => write!(f, "local"),
        }
    }
}

pub(crate) const DEFAULT_SSH_PORT: u16 = 22;

/// A deployment target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Display name
    pub name: String,

    /// Hostname or IP to connect to
    pub address: String,

    /// SSH port
    pub port: u16,

    /// Login user
    pub user: String,

    /// Private key used for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,

    /// Login password; never serialized
    #[serde(skip)]
    pub password: Option<String>,

    /// Transport used to reach the host
    #[serde(default)]
    pub transport: Transport,

    /// Roles this host was resolved under
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Host {
    /// Create a new SSH host named and addressed `name`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address: name.clone(),
            name,
            port: DEFAULT_SSH_PORT,
            user: default_user(),
            private_key: None,
            password: None,
            transport: Transport::Ssh,
            roles: BTreeSet::new(),
        }
    }

    /// Parse a `[user@]address[:port]` host spec
    pub fn parse(spec: &str) -> Result<Self, HostParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(HostParseError::EmptyInput);
        }

        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user), rest),
            Some(_) => return Err(HostParseError::EmptyUser(spec.to_string())),
            None => (None, spec),
        };

        let (address, port) = match rest.rsplit_once(':') {
            Some((address, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| HostParseError::InvalidPort(port.to_string()))?;
                (address, port)
            }
            None => (rest, DEFAULT_SSH_PORT),
        };

        if address.is_empty() {
            return Err(HostParseError::EmptyInput);
        }

        let mut host = Host::new(address);
        host.port = port;
        if let Some(user) = user {
            host.user = user.to_string();
        }
        Ok(host)
    }

    /// Key identifying a reusable session to this host
    pub fn pool_key(&self) -> String {
        match self.transport {
            Transport::Ssh => format!("ssh://{}@{}:{}", self.user, self.address, self.port),
            Transport::Local => format!("local://{}", self.name),
        }
    }

    /// Address and port; two entries with the same endpoint are the same machine
    pub fn endpoint(&self) -> (&str, u16) {
        (&self.address, self.port)
    }

    /// Tag the host with a role
    pub fn add_role(&mut self, role: impl Into<String>) {
        self.roles.insert(role.into());
    }

    /// Check whether the host carries `role`
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.pool_key() == other.pool_key()
    }
}

impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pool_key().hash(state);
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if self.transport == Transport::Ssh && self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Errors that can occur when parsing a host spec
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostParseError {
    #[error("empty host spec")]
    EmptyInput,
    #[error("empty user in host spec '{0}'")]
    EmptyUser(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}
