//! Tests for the fedra-rdbc resource pool

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::MockFactory;
use fedra_rdbc::prelude::*;

/// Base config for tests: no background reaper, short waits.
fn config() -> PoolConfig {
    PoolConfig::default()
        .with_shrink_enabled(false)
        .with_acquire_timeout(Duration::from_millis(200))
}

// ==================== Capacity & Quota Scenarios ====================

/// One identity acquires 4 of 10, then releases one normally and one with
/// force-close.
#[tokio::test]
async fn test_acquire_release_accounting() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(10)
            .with_max_connections_per_identity(5),
        factory.clone(),
    )
    .unwrap();
    let id = Identity::new("id1");

    let mut conns = Vec::new();
    for _ in 0..4 {
        conns.push(pool.acquire(&id).await.unwrap());
    }

    let status = pool.status();
    assert_eq!(status.created, 4);
    assert_eq!(status.total, 4);
    assert_eq!(status.in_use, 4);
    assert_eq!(status.idle, 0);

    pool.release(&conns[1], false).await;
    pool.release(&conns[3], true).await;

    let status = pool.status();
    assert_eq!(status.total, 3);
    assert_eq!(status.destroyed, 1);
    assert_eq!(status.in_use, 2);
    assert_eq!(status.idle, 1);
    assert_eq!(factory.closed(), 1);
}

/// A 6th acquisition for an identity capped at 5 blocks for the full
/// acquire timeout, then fails identity-scoped.
#[tokio::test]
async fn test_identity_exhaustion() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(10)
            .with_max_connections_per_identity(5)
            .with_acquire_timeout(Duration::from_millis(100)),
        factory,
    )
    .unwrap();
    let id = Identity::new("id1");

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire(&id).await.unwrap());
    }

    let start = Instant::now();
    let err = pool.acquire(&id).await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(matches!(
        err,
        Error::PoolExhausted {
            scope: ExhaustionScope::Identity,
            ..
        }
    ));
    assert_eq!(pool.status().exhausted, 1);

    // The global permit taken before the sub-quota wait went back.
    assert_eq!(pool.available_permits(), 5);

    // Other identities are unaffected by one identity's exhaustion.
    let other = pool.acquire(&Identity::new("id2")).await.unwrap();
    pool.release(&other, false).await;
}

/// Exhausting the whole pool fails global-scoped.
#[tokio::test]
async fn test_global_exhaustion() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(2)
            .with_acquire_timeout(Duration::from_millis(50)),
        factory,
    )
    .unwrap();

    let _a = pool.acquire(&Identity::new("a")).await.unwrap();
    let _b = pool.acquire(&Identity::new("a")).await.unwrap();

    let err = pool.acquire(&Identity::new("b")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::PoolExhausted {
            scope: ExhaustionScope::Global,
            ..
        }
    ));
    assert!(err.is_retriable());
}

/// With a single global slot, a second identity still gets served after
/// the first releases; the in-system total stays at one.
#[tokio::test]
async fn test_single_slot_across_identities() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(1)
            .with_max_connections_per_identity(1),
        factory,
    )
    .unwrap();

    let x = pool.acquire(&Identity::new("x")).await.unwrap();
    pool.release(&x, false).await;

    let y = pool.acquire(&Identity::new("y")).await.unwrap();
    let status = pool.status();
    assert_eq!(status.total, 1);
    assert_eq!(status.in_use, 1);
    assert_eq!(status.idle, 0);
    assert_eq!(status.created, 2);
    assert_eq!(status.destroyed, 1);

    pool.release(&y, false).await;
    assert_eq!(pool.status().total, 1);
}

// ==================== Invariants Under Concurrency ====================

/// in_use never exceeds max_connections under concurrent acquire/release,
/// and the pool is fully restored at quiescence.
#[tokio::test]
async fn test_capacity_invariant_concurrent() {
    const MAX: usize = 4;
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(MAX)
            .with_acquire_timeout(Duration::from_secs(5)),
        factory,
    )
    .unwrap();

    let mut tasks = Vec::new();
    for t in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let id = Identity::new(format!("tenant-{}", t % 3));
            for _ in 0..10 {
                let conn = pool.acquire(&id).await.unwrap();
                assert!(pool.status().in_use <= MAX);
                tokio::task::yield_now().await;
                pool.release(&conn, false).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert!(status.total <= MAX);
    assert_eq!(status.total, status.idle);
    assert_eq!(status.created - status.destroyed, status.total as u64);
    assert_eq!(pool.available_permits(), MAX);
}

/// No identity ever holds more than its sub-quota, used + unused.
#[tokio::test]
async fn test_per_identity_invariant_concurrent() {
    const QUOTA: usize = 2;
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(8)
            .with_max_connections_per_identity(QUOTA)
            .with_acquire_timeout(Duration::from_secs(5)),
        factory,
    )
    .unwrap();
    let id = Identity::new("hot");

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let conn = pool.acquire(&id).await.unwrap();
                let snapshot = pool.identity_snapshot(&id).unwrap();
                assert!(snapshot.used + snapshot.unused <= QUOTA);
                tokio::task::yield_now().await;
                pool.release(&conn, false).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = pool.identity_snapshot(&id).unwrap();
    assert_eq!(snapshot.used, 0);
    assert!(snapshot.unused <= QUOTA);
    assert_eq!(snapshot.available_quota, Some(QUOTA));
}

// ==================== Permit Symmetry ====================

#[tokio::test]
async fn test_permit_symmetry() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(3)
            .with_max_connections_per_identity(2),
        factory,
    )
    .unwrap();
    let id = Identity::new("id1");

    let a = pool.acquire(&id).await.unwrap();
    let b = pool.acquire(&id).await.unwrap();
    assert_eq!(pool.available_permits(), 1);
    assert_eq!(
        pool.identity_snapshot(&id).unwrap().available_quota,
        Some(0)
    );

    // One normal return, one forced close: both return their permits.
    pool.release(&a, false).await;
    pool.release(&b, true).await;

    assert_eq!(pool.available_permits(), 3);
    assert_eq!(
        pool.identity_snapshot(&id).unwrap().available_quota,
        Some(2)
    );
    assert_eq!(pool.status().in_use, 0);
}

#[tokio::test]
async fn test_creation_failure_returns_permits() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_max_connections(3)
            .with_max_connections_per_identity(2),
        factory.clone(),
    )
    .unwrap();
    let id = Identity::new("id1");

    factory.fail_next_opens(1);
    let err = pool.acquire(&id).await.unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));

    // No permits leaked, no phantom connections.
    assert_eq!(pool.available_permits(), 3);
    assert_eq!(
        pool.identity_snapshot(&id).unwrap().available_quota,
        Some(2)
    );
    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.created, 0);

    // The pool is not corrupted: the next acquire succeeds.
    let conn = pool.acquire(&id).await.unwrap();
    pool.release(&conn, false).await;
}

// ==================== Reuse ====================

#[tokio::test]
async fn test_idle_reuse_same_identity() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config(), factory.clone()).unwrap();
    let id = Identity::new("id1");

    let first = pool.acquire(&id).await.unwrap();
    pool.release(&first, false).await;

    let second = pool.acquire(&id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.opened(), 1);
    pool.release(&second, false).await;
}

#[tokio::test]
async fn test_reuse_order_is_first_idle() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config(), factory).unwrap();
    let id = Identity::new("id1");

    let a = pool.acquire(&id).await.unwrap();
    let b = pool.acquire(&id).await.unwrap();
    pool.release(&a, false).await;
    pool.release(&b, false).await;

    // a went idle first, so a comes back first.
    let first = pool.acquire(&id).await.unwrap();
    let second = pool.acquire(&id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &a));
    assert!(Arc::ptr_eq(&second, &b));
}

#[tokio::test]
async fn test_identities_never_share_connections() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config(), factory.clone()).unwrap();

    let alice = pool.acquire(&Identity::new("alice")).await.unwrap();
    let bob = pool.acquire(&Identity::new("bob")).await.unwrap();

    assert!(!Arc::ptr_eq(&alice, &bob));
    assert_eq!(factory.opened(), 2);

    // alice's idle connection is not handed to bob.
    pool.release(&alice, false).await;
    let bob2 = pool.acquire(&Identity::new("bob")).await.unwrap();
    assert!(!Arc::ptr_eq(&bob2, &alice));
    assert_eq!(factory.opened(), 3);
}

// ==================== Liveness ====================

#[tokio::test]
async fn test_reuse_does_not_probe_within_interval() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config().with_liveness_interval(Duration::from_secs(600)),
        factory.clone(),
    )
    .unwrap();
    let id = Identity::new("id1");

    for _ in 0..5 {
        let conn = pool.acquire(&id).await.unwrap();
        pool.release(&conn, false).await;
    }

    // Probing on every reuse would flood the backing store.
    assert_eq!(factory.probes(), 0);
    assert_eq!(factory.opened(), 1);
}

#[tokio::test]
async fn test_dead_idle_connection_evicted_on_acquire() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config().with_liveness_interval(Duration::ZERO),
        factory.clone(),
    )
    .unwrap();
    let id = Identity::new("id1");

    let first = pool.acquire(&id).await.unwrap();
    pool.release(&first, false).await;

    // The backend dropped the connection while it sat idle.
    factory.set_valid(false);

    let second = pool.acquire(&id).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    let status = pool.status();
    assert_eq!(status.created, 2);
    assert_eq!(status.destroyed, 1);
    assert_eq!(status.probe_failures, 1);
    assert_eq!(status.total, 1);
}

// ==================== Reaping ====================

#[tokio::test]
async fn test_reap_evicts_expired_idle() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config().with_idle_ttl(Duration::from_millis(10)), factory)
        .unwrap();
    let id = Identity::new("id1");

    let conn = pool.acquire(&id).await.unwrap();
    pool.release(&conn, false).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.reap(false).await;

    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.destroyed, 1);
    assert_eq!(pool.identity_snapshot(&id).unwrap().unused, 0);
}

#[tokio::test]
async fn test_reap_spares_fresh_idle_and_in_use() {
    let factory = MockFactory::new();
    let pool =
        ResourcePool::new(config().with_idle_ttl(Duration::from_secs(60)), factory).unwrap();
    let id = Identity::new("id1");

    let held = pool.acquire(&id).await.unwrap();
    let idle = pool.acquire(&id).await.unwrap();
    pool.release(&idle, false).await;

    pool.reap(false).await;

    let status = pool.status();
    assert_eq!(status.total, 2);
    assert_eq!(status.in_use, 1);
    assert_eq!(status.idle, 1);

    pool.release(&held, false).await;
}

#[tokio::test]
async fn test_forced_reap_ignores_ttl() {
    let factory = MockFactory::new();
    let pool =
        ResourcePool::new(config().with_idle_ttl(Duration::from_secs(60)), factory).unwrap();
    let id = Identity::new("id1");

    let conn = pool.acquire(&id).await.unwrap();
    pool.release(&conn, false).await;

    pool.reap(true).await;
    assert_eq!(pool.status().total, 0);

    // The bucket itself persists for the pool's lifetime.
    assert!(pool.identity_snapshot(&id).is_some());
}

#[tokio::test]
async fn test_background_reaper() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(
        config()
            .with_shrink_enabled(true)
            .with_reap_interval(Duration::from_millis(20))
            .with_idle_ttl(Duration::from_millis(10)),
        factory,
    )
    .unwrap();
    let id = Identity::new("id1");

    let conn = pool.acquire(&id).await.unwrap();
    pool.release(&conn, false).await;

    // No foreground call: the reaper alone evicts the expired idle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.destroyed, 1);

    pool.shutdown().await;
}

// ==================== Release Semantics ====================

#[tokio::test]
async fn test_double_release_is_noop() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config().with_max_connections(3), factory).unwrap();
    let id = Identity::new("id1");

    let conn = pool.acquire(&id).await.unwrap();
    pool.release(&conn, false).await;
    pool.release(&conn, false).await;
    pool.release(&conn, true).await;

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.idle, 1);
    assert_eq!(status.destroyed, 0);
    assert_eq!(pool.available_permits(), 3);
}

#[tokio::test]
async fn test_release_of_dead_connection_destroys_it() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config(), factory.clone()).unwrap();
    let id = Identity::new("id1");

    let conn = pool.acquire(&id).await.unwrap();
    conn.mark_dead();
    pool.release(&conn, false).await;

    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.destroyed, 1);
    assert_eq!(factory.closed(), 1);
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_shutdown_closes_idle_and_rejects_acquires() {
    let factory = MockFactory::new();
    let pool = ResourcePool::new(config(), factory.clone()).unwrap();
    let id = Identity::new("id1");

    let held = pool.acquire(&id).await.unwrap();
    let idle = pool.acquire(&id).await.unwrap();
    pool.release(&idle, false).await;

    pool.shutdown().await;

    // Idle connections closed immediately.
    assert_eq!(pool.status().idle, 0);
    assert_eq!(factory.closed(), 1);

    // Subsequent acquires fail fast, without waiting.
    let start = Instant::now();
    let err = pool.acquire(&id).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    assert!(start.elapsed() < Duration::from_millis(50));

    // In-use connections are closed as they come back.
    pool.release(&held, false).await;
    assert_eq!(pool.status().total, 0);
    assert_eq!(factory.closed(), 2);

    // Shutdown is idempotent.
    pool.shutdown().await;
}

// ==================== Configuration ====================

#[tokio::test]
async fn test_invalid_config_rejected() {
    let factory = MockFactory::new();

    let err = ResourcePool::new(config().with_max_connections(0), factory.clone()).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert!(!err.is_retriable());

    let err = ResourcePool::new(
        config().with_max_connections_per_identity(0),
        factory,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[tokio::test]
async fn test_wait_time_recorded() {
    let factory = MockFactory::new();
    factory.set_open_delay(Duration::from_millis(20));
    let pool = ResourcePool::new(config(), factory).unwrap();

    let conn = pool.acquire(&Identity::new("id1")).await.unwrap();
    assert!(pool.status().total_wait_ms >= 20);
    assert!(pool.avg_wait_ms() >= 20.0);
    pool.release(&conn, false).await;
}
