//! Host group resolution.
//!
//! The [`Inventory`] maps symbolic roles (`web`, `worker`, ...) to ordered
//! host lists. Resolution fails fast: an unknown or empty role is an error,
//! never an empty host list, and a role listing the same machine twice is
//! rejected.

pub mod host;

pub use host::{Host, HostParseError, Transport};

use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Error, Result};

/// Role to host mapping for one environment
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Hosts keyed by their session key, in first-seen order
    hosts: IndexMap<String, Host>,
    /// Role name to host keys, in configured order
    roles: IndexMap<String, Vec<String>>,
}

impl Inventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `host` under `role`.
    ///
    /// A host already known under another role gains the new role tag, so a
    /// machine listed in several roles carries all of them.
    pub fn add(&mut self, role: impl Into<String>, mut host: Host) -> &mut Self {
        let role = role.into();
        let key = host.pool_key();

        match self.hosts.get_mut(&key) {
            Some(existing) => existing.add_role(role.clone()),
            None => {
                host.add_role(role.clone());
                self.hosts.insert(key.clone(), host);
            }
        }

        self.roles.entry(role).or_default().push(key);
        self
    }

    /// Declare a role without hosts
    pub fn declare_role(&mut self, role: impl Into<String>) -> &mut Self {
        self.roles.entry(role.into()).or_default();
        self
    }

    /// Resolve a role to its hosts, in configured order.
    pub fn resolve(&self, role: &str) -> Result<Vec<Arc<Host>>> {
        let keys = self
            .roles
            .get(role)
            .filter(|keys| !keys.is_empty())
            .ok_or_else(|| Error::UnknownRole(role.to_string()))?;

        let mut seen = HashSet::with_capacity(keys.len());
        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            let host = self
                .hosts
                .get(key)
                .ok_or_else(|| Error::UnknownRole(role.to_string()))?;

            if !seen.insert(host.endpoint()) {
                return Err(Error::DuplicateHost {
                    role: role.to_string(),
                    host: host.to_string(),
                });
            }
            resolved.push(Arc::new(host.clone()));
        }

        trace!(role = %role, count = resolved.len(), "Resolved role");
        Ok(resolved)
    }

    /// Resolve a role that must contain exactly one host.
    pub fn require_single(&self, role: &str) -> Result<Arc<Host>> {
        let mut hosts = self.resolve(role)?;
        if hosts.len() != 1 {
            return Err(Error::Cardinality {
                role: role.to_string(),
                found: hosts.len(),
            });
        }
        hosts.pop().ok_or_else(|| Error::UnknownRole(role.to_string()))
    }

    /// Configured role names
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    /// All distinct hosts
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Number of distinct hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(spec: &str) -> Host {
        Host::parse(spec).unwrap()
    }

    #[test]
    fn test_resolve_preserves_order() {
        let mut inv = Inventory::new();
        inv.add("worker", host("w2")).add("worker", host("w1"));

        let names: Vec<_> = inv
            .resolve("worker")
            .unwrap()
            .iter()
            .map(|h| h.name.clone())
            .collect();
        assert_eq!(names, vec!["w2", "w1"]);
    }

    #[test]
    fn test_unknown_and_empty_roles() {
        let mut inv = Inventory::new();
        inv.declare_role("db");
        assert!(matches!(inv.resolve("web"), Err(Error::UnknownRole(r)) if r == "web"));
        assert!(matches!(inv.resolve("db"), Err(Error::UnknownRole(_))));
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let mut inv = Inventory::new();
        inv.add("web", host("root@web1")).add("web", host("deploy@web1"));
        assert!(matches!(
            inv.resolve("web"),
            Err(Error::DuplicateHost { role, .. }) if role == "web"
        ));
    }

    #[test]
    fn test_same_host_different_ports_allowed() {
        let mut inv = Inventory::new();
        inv.add("web", host("web1:22")).add("web", host("web1:2222"));
        assert_eq!(inv.resolve("web").unwrap().len(), 2);
    }

    #[test]
    fn test_require_single() {
        let mut inv = Inventory::new();
        inv.add("web", host("web1"));
        assert_eq!(inv.require_single("web").unwrap().name, "web1");

        inv.add("web", host("web2"));
        assert_eq!(inv.resolve("web").unwrap().len(), 2);
        assert!(matches!(
            inv.require_single("web"),
            Err(Error::Cardinality { found: 2, .. })
        ));
    }

    #[test]
    fn test_roles_union_across_groups() {
        let mut inv = Inventory::new();
        inv.add("web", host("box1")).add("worker", host("box1"));

        assert_eq!(inv.host_count(), 1);
        let resolved = inv.resolve("worker").unwrap();
        assert!(resolved[0].has_role("web"));
        assert!(resolved[0].has_role("worker"));
    }
}
