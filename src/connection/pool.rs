//! Session pool.
//!
//! The pool is the only shared mutable resource of a run. Sessions are keyed
//! by [`Host::pool_key`] and handed out as [`PooledSession`] guards; a guard
//! that goes out of scope returns its session to the idle list, so a session
//! is released on every exit path of a task, including panics.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Connection, ConnectionError, Connector};
use crate::error::{Error, Result};
use crate::inventory::Host;

/// Statistics for the connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions established through the connector
    pub created: usize,
    /// Acquisitions served from an idle session
    pub reused: usize,
    /// Sessions explicitly invalidated
    pub invalidated: usize,
    /// Idle sessions found dead on acquisition
    pub discarded: usize,
    /// Failed connection attempts
    pub failures: usize,
    /// Sessions currently checked out
    pub in_use: usize,
    /// Sessions currently idle
    pub idle: usize,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    idle: Mutex<HashMap<String, Vec<Arc<dyn Connection>>>>,
    stats: Mutex<PoolStats>,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn put_back(&self, key: &str, conn: Arc<dyn Connection>) {
        {
            let mut stats = self.stats.lock();
            stats.in_use = stats.in_use.saturating_sub(1);
        }

        if self.shutdown.load(Ordering::SeqCst) {
            // Pool is closing: close instead of parking the session.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = conn.close().await;
                });
            }
            return;
        }

        self.idle
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(conn);
        self.stats.lock().idle += 1;
    }
}

/// Thread-safe pool of reusable sessions.
///
/// Cloning the pool is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool that opens new sessions through `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(HashMap::new()),
                stats: Mutex::new(PoolStats::default()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire a live session to `host`.
    ///
    /// Reuses an idle session when one passes its liveness check; dead idle
    /// sessions are dropped. Connection failures are not retried here.
    pub async fn acquire(&self, host: &Host) -> Result<PooledSession> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::connection(
                &host.name,
                ConnectionError::ConnectionClosed,
            ));
        }

        let key = host.pool_key();

        loop {
            let candidate = self.inner.idle.lock().get_mut(&key).and_then(Vec::pop);
            let Some(conn) = candidate else { break };
            {
                let mut stats = self.inner.stats.lock();
                stats.idle = stats.idle.saturating_sub(1);
            }

            if conn.is_alive().await {
                debug!(key = %key, "Reusing existing session from pool");
                let mut stats = self.inner.stats.lock();
                stats.reused += 1;
                stats.in_use += 1;
                return Ok(PooledSession::new(conn, key, Arc::clone(&self.inner)));
            }

            warn!(key = %key, "Discarding dead idle session");
            self.inner.stats.lock().discarded += 1;
            let _ = conn.close().await;
        }

        debug!(key = %key, "Creating new session");
        match self.inner.connector.connect(host).await {
            Ok(conn) => {
                let mut stats = self.inner.stats.lock();
                stats.created += 1;
                stats.in_use += 1;
                Ok(PooledSession::new(conn, key, Arc::clone(&self.inner)))
            }
            Err(e) => {
                self.inner.stats.lock().failures += 1;
                Err(Error::connection(&host.name, e))
            }
        }
    }

    /// Return a session to the pool without closing it.
    pub fn release(&self, session: PooledSession) {
        drop(session);
    }

    /// Close a broken session and keep it out of the pool.
    pub async fn invalidate(&self, mut session: PooledSession) {
        if let Some(conn) = session.take() {
            debug!(key = %session.key, "Invalidating session");
            {
                let mut stats = self.inner.stats.lock();
                stats.in_use = stats.in_use.saturating_sub(1);
                stats.invalidated += 1;
            }
            if let Err(e) = conn.close().await {
                warn!(key = %session.key, error = %e, "Error closing invalidated session");
            }
        }
    }

    /// Close every idle session. Sessions still checked out are closed when
    /// their guards drop.
    pub async fn close_all(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<dyn Connection>> = {
            let mut idle = self.inner.idle.lock();
            idle.drain().flat_map(|(_, conns)| conns).collect()
        };
        self.inner.stats.lock().idle = 0;

        for conn in drained {
            let _ = conn.close().await;
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().clone()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out session. Dropping it releases the session to the pool.
pub struct PooledSession {
    conn: Option<Arc<dyn Connection>>,
    key: String,
    pool: Arc<PoolInner>,
    released: AtomicBool,
}

impl PooledSession {
    fn new(conn: Arc<dyn Connection>, key: String, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            key,
            pool,
            released: AtomicBool::new(false),
        }
    }

    /// The underlying connection.
    ///
    /// The returned handle must not outlive the task that acquired it.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.conn.clone()
    }

    /// Pool key of this session
    pub fn key(&self) -> &str {
        &self.key
    }

    fn take(&mut self) -> Option<Arc<dyn Connection>> {
        self.released.store(true, Ordering::SeqCst);
        self.conn.take()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Some(conn) = self.conn.take() {
                self.pool.put_back(&self.key, conn);
            }
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.key)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportConnector;
    use crate::inventory::Transport;

    fn local_host(name: &str) -> Host {
        let mut host = Host::new(name);
        host.transport = Transport::Local;
        host
    }

    #[tokio::test]
    async fn test_release_then_reuse() {
        let pool = ConnectionPool::new(Arc::new(TransportConnector::default()));
        let host = local_host("web1");

        let session = pool.acquire(&host).await.unwrap();
        assert_eq!(session.key(), "local://web1");
        pool.release(session);

        let _session = pool.acquire(&host).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reconnect() {
        let pool = ConnectionPool::new(Arc::new(TransportConnector::default()));
        let host = local_host("web1");

        let session = pool.acquire(&host).await.unwrap();
        pool.invalidate(session).await;
        assert_eq!(pool.stats().idle, 0);

        let _session = pool.acquire(&host).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.invalidated, 1);
        assert_eq!(stats.reused, 0);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let pool = ConnectionPool::new(Arc::new(TransportConnector::default()));
        let host = local_host("web1");
        {
            let _session = pool.acquire(&host).await.unwrap();
        }
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_close_all_rejects_new_work() {
        let pool = ConnectionPool::new(Arc::new(TransportConnector::default()));
        let host = local_host("web1");
        pool.release(pool.acquire(&host).await.unwrap());
        pool.close_all().await;

        let err = pool.acquire(&host).await.unwrap_err();
        assert!(err.is_transport());
    }
}
