//! Integration tests for the session pool

mod common;

use std::sync::Arc;

use rollout::connection::{ConnectionPool, Connector};
use rollout::inventory::Host;
use rollout::Error;

use common::*;

fn pool(connector: &Arc<MockConnector>) -> ConnectionPool {
    ConnectionPool::new(Arc::clone(connector) as Arc<dyn Connector>)
}

#[tokio::test]
async fn test_released_session_is_reused() {
    let connector = MockConnector::new();
    let pool = pool(&connector);
    let host = Host::new("web1");

    let session = pool.acquire(&host).await.unwrap();
    pool.release(session);
    let again = pool.acquire(&host).await.unwrap();

    assert_eq!(connector.host("web1").connects(), 1);
    assert_eq!(again.connection().unwrap().identifier(), "web1#1");
    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.in_use, 1);
}

#[tokio::test]
async fn test_dropped_guard_returns_session() {
    let connector = MockConnector::new();
    let pool = pool(&connector);
    let host = Host::new("web1");

    {
        let _session = pool.acquire(&host).await.unwrap();
        assert_eq!(pool.stats().in_use, 1);
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_concurrent_checkouts_get_distinct_sessions() {
    let connector = MockConnector::new();
    let pool = pool(&connector);
    let host = Host::new("web1");

    let first = pool.acquire(&host).await.unwrap();
    let second = pool.acquire(&host).await.unwrap();

    assert_ne!(
        first.connection().unwrap().identifier(),
        second.connection().unwrap().identifier()
    );
    assert_eq!(connector.host("web1").connects(), 2);
}

#[tokio::test]
async fn test_invalidated_session_is_closed_and_not_reused() {
    let connector = MockConnector::new();
    let pool = pool(&connector);
    let host = Host::new("web1");

    let session = pool.acquire(&host).await.unwrap();
    pool.invalidate(session).await;
    let _fresh = pool.acquire(&host).await.unwrap();

    assert_eq!(connector.host("web1").connects(), 2);
    assert_eq!(connector.host("web1").closes(), 1);
    assert_eq!(pool.stats().invalidated, 1);
}

#[tokio::test]
async fn test_dead_idle_session_is_discarded() {
    let connector = MockConnector::new();
    let pool = pool(&connector);
    let host = Host::new("web1");

    let session = pool.acquire(&host).await.unwrap();
    session.connection().unwrap().close().await.unwrap();
    pool.release(session);

    let _fresh = pool.acquire(&host).await.unwrap();
    assert_eq!(connector.host("web1").connects(), 2);
    assert_eq!(pool.stats().discarded, 1);
}

#[tokio::test]
async fn test_sessions_keyed_by_endpoint() {
    let connector = MockConnector::new();
    let pool = pool(&connector);

    let a = pool.acquire(&Host::parse("deploy@web1").unwrap()).await.unwrap();
    pool.release(a);
    let b = pool.acquire(&Host::parse("root@web1").unwrap()).await.unwrap();
    pool.release(b);

    assert_eq!(connector.host("web1").connects(), 2);
    assert_eq!(pool.stats().reused, 0);
}

#[tokio::test]
async fn test_connect_failure_is_connection_error() {
    let connector = MockConnector::new();
    connector.refuse("db1");
    let pool = pool(&connector);

    let result = pool.acquire(&Host::new("db1")).await;

    assert!(matches!(result, Err(Error::Connection { ref host, .. }) if host == "db1"));
    assert_eq!(pool.stats().failures, 1);
}

#[tokio::test]
async fn test_close_all_closes_idle_and_refuses_new() {
    let connector = MockConnector::new();
    let pool = pool(&connector);

    for name in ["web1", "web2"] {
        let session = pool.acquire(&Host::new(name)).await.unwrap();
        pool.release(session);
    }
    pool.close_all().await;

    assert_eq!(connector.host("web1").closes(), 1);
    assert_eq!(connector.host("web2").closes(), 1);
    assert_eq!(pool.stats().idle, 0);
    assert!(pool.acquire(&Host::new("web1")).await.is_err());
}
