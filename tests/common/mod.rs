//! Shared test utilities for the rollout test suite.
//!
//! This module provides:
//! - A mock [`Connection`] backed by a per-host virtual filesystem
//! - Scripted command replies (exit codes, dropped sessions, timeouts)
//! - A mock [`Connector`] that counts sessions and tracks concurrency
//! - Inventory and configuration fixtures
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use rollout::connection::{
    CommandResult, Connection, ConnectionError, ConnectionResult, Connector, ExecuteOptions,
    TransferOptions,
};
use rollout::inventory::{Host, Inventory};

// ============================================================================
// Scripted replies
// ============================================================================

/// What a mock session answers to a matching command
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit with the given code and stdout
    Exit(i32, String),
    /// The session drops mid-command
    Drop,
    /// The command exceeds its timeout
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

/// State of one mock host, shared by every session opened to it
#[derive(Default)]
pub struct MockHost {
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    rules: Mutex<Vec<Rule>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    refuse: AtomicBool,
}

impl MockHost {
    /// Commands executed on this host, as composed shell lines
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Contents of a file in the virtual filesystem
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().get(path.as_ref()).cloned()
    }

    /// Every path in the virtual filesystem
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().keys().cloned().collect()
    }

    /// Sessions opened to this host
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed on this host
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn reply_for(&self, line: &str) -> Reply {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if !line.contains(&rule.pattern) {
                continue;
            }
            match rule.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return rule.reply.clone();
        }
        Reply::Exit(0, String::new())
    }
}

// ============================================================================
// Mock Connection
// ============================================================================

/// A session to a [`MockHost`]
pub struct MockConnection {
    identifier: String,
    host: Arc<MockHost>,
    tracker: Arc<ConcurrencyTracker>,
    alive: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        let options = options.unwrap_or_default();
        let line = options.compose(command);
        self.host.commands.lock().push(line.clone());

        let latency = *self.host.latency.lock();
        if let Some(latency) = latency {
            self.tracker.enter();
            tokio::time::sleep(latency).await;
            self.tracker.exit();
        }

        match self.host.reply_for(&line) {
            Reply::Exit(0, stdout) => Ok(CommandResult::success(stdout, String::new())),
            Reply::Exit(code, stdout) => Ok(CommandResult::failure(code, stdout, String::new())),
            Reply::Drop => {
                self.alive.store(false, Ordering::SeqCst);
                Err(ConnectionError::ConnectionClosed)
            }
            Reply::Timeout => Err(ConnectionError::Timeout(options.timeout.unwrap_or(1))),
        }
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        _options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        self.host
            .files
            .lock()
            .insert(remote_path.to_path_buf(), content.to_vec());
        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        self.host
            .files
            .lock()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| {
                ConnectionError::TransferFailed(format!("{} not found", remote_path.display()))
            })
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        Ok(self.host.files.lock().contains_key(path))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.host.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Tracks how many commands are in flight at once
#[derive(Default)]
pub struct ConcurrencyTracker {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyTracker {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Connector handing out [`MockConnection`]s keyed by host name
#[derive(Default)]
pub struct MockConnector {
    hosts: Mutex<HashMap<String, Arc<MockHost>>>,
    tracker: Arc<ConcurrencyTracker>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// State of `name`, created on first use
    pub fn host(&self, name: &str) -> Arc<MockHost> {
        Arc::clone(self.hosts.lock().entry(name.to_string()).or_default())
    }

    /// Answer commands containing `pattern` on `host` with `reply`
    pub fn on(&self, host: &str, pattern: &str, reply: Reply) {
        self.host(host).rules.lock().push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining: None,
        });
    }

    /// Like [`MockConnector::on`], for the first `times` matches only
    pub fn on_times(&self, host: &str, pattern: &str, reply: Reply, times: usize) {
        self.host(host).rules.lock().push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining: Some(times),
        });
    }

    /// Make every command on `host` take `latency`
    pub fn latency(&self, host: &str, latency: Duration) {
        *self.host(host).latency.lock() = Some(latency);
    }

    /// Refuse new sessions to `host`
    pub fn refuse(&self, host: &str) {
        self.host(host).refuse.store(true, Ordering::SeqCst);
    }

    /// Sessions opened across all hosts
    pub fn total_connects(&self) -> usize {
        self.hosts.lock().values().map(|h| h.connects()).sum()
    }

    /// Highest number of commands observed in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.tracker.max()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        let state = self.host(&host.name);
        if state.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{}: connection refused",
                host.address
            )));
        }
        let n = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockConnection {
            identifier: format!("{}#{}", host.name, n),
            host: state,
            tracker: Arc::clone(&self.tracker),
            alive: AtomicBool::new(true),
        }))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Inventory from `(role, [host, ...])` pairs
pub fn inventory(roles: &[(&str, &[&str])]) -> Inventory {
    let mut inventory = Inventory::new();
    for (role, hosts) in roles {
        inventory.declare_role(*role);
        for name in *hosts {
            inventory.add(*role, Host::new(*name));
        }
    }
    inventory
}

/// The usual web + worker layout
pub fn web_and_workers() -> Inventory {
    inventory(&[("web", &["web1", "web2"]), ("worker", &["w1", "w2", "w3"])])
}

/// Write `content` to `deploy.toml` in a fresh temporary directory
pub fn config_file(content: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("deploy.toml");
    let mut file = std::fs::File::create(&path).expect("Failed to create config file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config file");
    (dir, path)
}
