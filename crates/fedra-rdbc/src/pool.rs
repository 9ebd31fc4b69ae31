//! Capacity-bounded connection broker
//!
//! [`ResourcePool`] brokers access to physical data-source connections
//! across concurrent query executions and credential contexts:
//!
//! - Bounded global concurrency via a fair semaphore
//! - Independent per-identity sub-quotas
//! - Safe reuse of idle connections with throttled liveness checks
//! - Background reaping of idle/dead connections
//! - Predictable timeout behavior under load
//!
//! # Example
//!
//! ```rust,ignore
//! use fedra_rdbc::prelude::*;
//!
//! let pool = ResourcePool::new(
//!     PoolConfig::default().with_max_connections(10),
//!     Arc::new(PgConnectionFactory::new(cfg)),
//! )?;
//!
//! let conn = pool.acquire(&Identity::shared()).await?;
//! // ... execute work against conn.raw() ...
//! pool.release(&conn, false).await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::connection::ConnectionFactory;
use crate::error::{Error, ExhaustionScope, Result};
use crate::identity::Identity;
use crate::resource::PooledResource;

/// Pool configuration.
///
/// Validated once at pool construction; immutable afterwards.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections in the system, used + idle, across all
    /// identities (must be >= 1)
    pub max_connections: usize,
    /// Maximum connections a single identity may hold, used + idle
    /// (must be >= 1); a sub-quota only applies when strictly less than
    /// `max_connections`
    pub max_connections_per_identity: usize,
    /// Idle connections older than this are evicted by the reaper
    pub idle_ttl: Duration,
    /// Maximum time an acquire may wait across both admission limits
    pub acquire_timeout: Duration,
    /// How often the background reaper runs
    pub reap_interval: Duration,
    /// Whether the background reaper runs at all
    pub shrink_enabled: bool,
    /// Minimum time between liveness probes of one connection
    pub liveness_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_connections_per_identity: 10,
            idle_ttl: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(120),
            reap_interval: Duration::from_secs(60),
            shrink_enabled: true,
            liveness_interval: Duration::from_secs(600),
        }
    }
}

impl PoolConfig {
    /// Set the global connection limit
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-identity connection limit
    pub fn with_max_connections_per_identity(mut self, max: usize) -> Self {
        self.max_connections_per_identity = max;
        self
    }

    /// Set the idle TTL
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the reap interval
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Enable/disable the background reaper
    pub fn with_shrink_enabled(mut self, enabled: bool) -> Self {
        self.shrink_enabled = enabled;
        self
    }

    /// Set the minimum interval between liveness probes
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Validate limits. Called once by [`ResourcePool::new`].
    pub fn validate(&self) -> Result<()> {
        if self.max_connections < 1 {
            return Err(Error::config("max_connections must be >= 1"));
        }
        if self.max_connections_per_identity < 1 {
            return Err(Error::config("max_connections_per_identity must be >= 1"));
        }
        Ok(())
    }

    /// The per-identity sub-quota, if one applies.
    fn identity_quota(&self) -> Option<usize> {
        (self.max_connections_per_identity < self.max_connections)
            .then_some(self.max_connections_per_identity)
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently in the system (used + idle)
    pub total: usize,
    /// Connections currently leased out
    pub in_use: usize,
    /// Connections returned and waiting in the pool for reuse
    pub idle: usize,
    /// Connections created over the pool's lifetime
    pub created: u64,
    /// Connections destroyed over the pool's lifetime
    pub destroyed: u64,
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Acquisitions that failed on an admission limit
    pub exhausted: u64,
    /// Cumulative acquire wait time in milliseconds
    pub total_wait_ms: u64,
    /// Liveness probes that found a connection dead
    pub probe_failures: u64,
}

/// Atomic pool counters for concurrent updates.
#[derive(Debug, Default)]
pub struct AtomicPoolCounters {
    total: AtomicUsize,
    in_use: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted: AtomicU64,
    total_wait_ms: AtomicU64,
    probe_failures: AtomicU64,
}

impl AtomicPoolCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation; returns the new in-system total.
    pub fn record_created(&self) -> usize {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a connection destruction.
    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a successful checkout and its wait time.
    pub fn record_checkout(&self, waited: Duration) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a checkin (lease returned).
    pub fn record_checkin(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record an acquisition that hit an admission limit.
    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a liveness probe that found a connection dead.
    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current values.
    pub fn snapshot(&self) -> PoolStatus {
        let total = self.total.load(Ordering::Acquire);
        let in_use = self.in_use.load(Ordering::Acquire);
        PoolStatus {
            total,
            in_use,
            idle: total.saturating_sub(in_use),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }

    /// Average acquire wait time in milliseconds.
    pub fn avg_wait_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Per-identity diagnostics snapshot.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    /// The identity this bucket belongs to
    pub identity: Identity,
    /// Number of leased connections
    pub used: usize,
    /// Number of idle connections awaiting reuse
    pub unused: usize,
    /// Remaining sub-quota permits, when a sub-quota applies
    pub available_quota: Option<usize>,
}

/// Per-identity partition of the pool.
///
/// Holds the used/unused lists under one lock, plus the sub-quota
/// semaphore when the per-identity limit is below the global one. Buckets
/// persist for the pool's lifetime, even when empty.
struct IdentityBucket {
    identity: Identity,
    quota: Option<Semaphore>,
    lists: Mutex<BucketLists>,
}

#[derive(Default)]
struct BucketLists {
    used: Vec<Arc<PooledResource>>,
    unused: VecDeque<Arc<PooledResource>>,
}

impl IdentityBucket {
    fn new(identity: Identity, quota: Option<usize>) -> Self {
        Self {
            identity,
            quota: quota.map(Semaphore::new),
            lists: Mutex::new(BucketLists::default()),
        }
    }

    fn quota(&self) -> Option<&Semaphore> {
        self.quota.as_ref()
    }

    /// First-idle (FIFO) reuse order.
    fn pop_unused(&self) -> Option<Arc<PooledResource>> {
        self.lists.lock().unused.pop_front()
    }

    fn push_unused(&self, resource: Arc<PooledResource>) {
        self.lists.lock().unused.push_back(resource);
    }

    fn push_used(&self, resource: Arc<PooledResource>) {
        self.lists.lock().used.push(resource);
    }

    /// Remove a leased resource. Returns false when it is not present,
    /// which is how a double release is detected and tolerated.
    fn remove_used(&self, resource: &Arc<PooledResource>) -> bool {
        let mut lists = self.lists.lock();
        match lists.used.iter().position(|r| Arc::ptr_eq(r, resource)) {
            Some(idx) => {
                lists.used.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remove every idle resource that is dead or (unless forced was
    /// requested, in which case all of them) has outlived `idle_ttl`.
    /// Never touches `used`.
    fn drain_reapable(&self, force: bool, idle_ttl: Duration) -> Vec<Arc<PooledResource>> {
        let mut lists = self.lists.lock();
        let mut reaped = Vec::new();
        lists.unused.retain(|res| {
            if force || res.is_dead() || res.idle_expired(idle_ttl) {
                reaped.push(res.clone());
                false
            } else {
                true
            }
        });
        reaped
    }

    fn snapshot(&self) -> IdentitySnapshot {
        let lists = self.lists.lock();
        IdentitySnapshot {
            identity: self.identity.clone(),
            used: lists.used.len(),
            unused: lists.unused.len(),
            available_quota: self.quota.as_ref().map(|q| q.available_permits()),
        }
    }
}

/// The capacity-bounded connection broker.
///
/// Two lock granularities: the pool-wide lock guards only the
/// identity→bucket map; each bucket's lock guards its own lists. Neither
/// is ever held across connection I/O, so creation and destruction for one
/// identity cannot stall unrelated identities.
pub struct ResourcePool {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Global admission control; fair (FIFO) so waiters are served in
    /// arrival order.
    semaphore: Semaphore,
    buckets: Mutex<HashMap<Identity, Arc<IdentityBucket>>>,
    counters: AtomicPoolCounters,
    shutting_down: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
    xa: bool,
}

impl ResourcePool {
    /// Create a pool for plain (non-XA) connections.
    ///
    /// Fails with a configuration error on invalid limits. When
    /// `shrink_enabled` is set this spawns the background reaper and must
    /// therefore be called within a Tokio runtime.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        Self::build(config, factory, false)
    }

    /// Create a pool whose connections serve distributed transactions.
    pub fn new_xa(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        Self::build(config, factory, true)
    }

    fn build(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        xa: bool,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let name = if xa {
            format!("{}/xa", factory.source_name())
        } else {
            factory.source_name().to_string()
        };

        let pool = Arc::new(Self {
            name,
            semaphore: Semaphore::new(config.max_connections),
            config,
            factory,
            buckets: Mutex::new(HashMap::new()),
            counters: AtomicPoolCounters::new(),
            shutting_down: AtomicBool::new(false),
            reaper: Mutex::new(None),
            xa,
        });

        if pool.config.shrink_enabled {
            *pool.reaper.lock() = Some(Self::spawn_reaper(&pool));
        }

        info!(
            pool = %pool.name,
            max_connections = pool.config.max_connections,
            max_per_identity = pool.config.max_connections_per_identity,
            shrink = pool.config.shrink_enabled,
            "connection pool initialized"
        );
        Ok(pool)
    }

    /// Check out a connection for `identity`, waiting at most
    /// `acquire_timeout` across both admission limits.
    ///
    /// Reuses the oldest-idle connection of the identity when one is alive;
    /// otherwise opens a new one through the factory, outside any pool
    /// lock. The returned resource carries one logical lease.
    pub async fn acquire(&self, identity: &Identity) -> Result<Arc<PooledResource>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let start = Instant::now();
        let deadline = start + self.config.acquire_timeout;
        let bucket = self.bucket(identity);

        // Global admission. The permit rides along as a guard until the
        // checkout succeeds, so a timeout, an error, or the caller
        // cancelling mid-wait can never leak it.
        let global_permit = match timeout_at(deadline, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                self.counters.record_exhausted();
                return Err(Error::exhausted(
                    ExhaustionScope::Global,
                    format!(
                        "identity {} waited {}ms for one of {} connections",
                        identity,
                        start.elapsed().as_millis(),
                        self.config.max_connections
                    ),
                ));
            }
        };

        // A shutdown may have begun while waiting.
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        // Per-identity sub-quota, bounded by the same absolute deadline so
        // total wait never exceeds acquire_timeout.
        let quota_permit = match bucket.quota() {
            Some(quota) => match timeout_at(deadline, quota.acquire()).await {
                Ok(Ok(permit)) => Some(permit),
                _ => {
                    self.counters.record_exhausted();
                    return Err(Error::exhausted(
                        ExhaustionScope::Identity,
                        format!(
                            "identity {} waited {}ms for one of {} per-identity connections",
                            identity,
                            start.elapsed().as_millis(),
                            self.config.max_connections_per_identity
                        ),
                    ));
                }
            },
            None => None,
        };

        // Reuse the identity's idle connections, oldest first, evicting any
        // that fail their (throttled) liveness check.
        while Instant::now() < deadline {
            let Some(candidate) = bucket.pop_unused() else {
                break;
            };
            if candidate.is_alive(self.config.liveness_interval).await {
                candidate.rebind(identity.clone());
                candidate.lease();
                bucket.push_used(candidate.clone());
                self.counters.record_checkout(start.elapsed());
                // The checked-out lease now accounts for the permits;
                // release() re-adds them.
                global_permit.forget();
                if let Some(permit) = quota_permit {
                    permit.forget();
                }
                debug!(pool = %self.name, identity = %identity, "reusing idle connection");
                return Ok(candidate);
            }
            self.counters.record_probe_failure();
            debug!(pool = %self.name, identity = %identity, "evicting dead idle connection");
            self.destroy(&candidate).await;
        }

        // Nothing reusable: open a fresh connection. On failure both
        // permit guards go back before the factory error propagates.
        let conn = match self.factory.open(identity).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(pool = %self.name, identity = %identity, error = %err, "connection creation failed");
                return Err(err);
            }
        };

        let resource = Arc::new(PooledResource::new(conn, identity.clone(), self.xa));
        resource.lease();
        bucket.push_used(resource.clone());
        let total = self.counters.record_created();
        self.counters.record_checkout(start.elapsed());
        global_permit.forget();
        if let Some(permit) = quota_permit {
            permit.forget();
        }
        debug!(pool = %self.name, identity = %identity, total, "opened new connection");

        // The semaphore bounds leases, not existence: idle connections of
        // other identities can push the in-system total past the limit
        // when this one was freshly created. Advisory correction only.
        if total > self.config.max_connections {
            self.correct_over_capacity(identity).await;
        }

        Ok(resource)
    }

    /// Return a leased resource to the pool.
    ///
    /// A resource that was force-closed, found dead, or returned during
    /// shutdown is destroyed; otherwise it joins its identity's idle list.
    /// Double release is tolerated as a no-op. Never fails: bookkeeping
    /// anomalies are logged and swallowed.
    pub async fn release(&self, resource: &Arc<PooledResource>, force_close: bool) {
        let identity = resource.identity();
        let Some(bucket) = self.find_bucket(&identity) else {
            debug!(pool = %self.name, identity = %identity, "release for unknown bucket ignored");
            return;
        };
        if !bucket.remove_used(resource) {
            debug!(pool = %self.name, identity = %identity, "double release ignored");
            return;
        }

        self.counters.record_checkin();

        if force_close || self.shutting_down.load(Ordering::Acquire) || resource.is_dead() {
            self.destroy(resource).await;
        } else {
            resource.touch_returned();
            bucket.push_unused(resource.clone());
        }

        // Identity permit back first, then global, the reverse of the
        // acquisition order, on every branch.
        if let Some(quota) = bucket.quota() {
            quota.add_permits(1);
        }
        self.semaphore.add_permits(1);
    }

    /// Evict idle connections: dead ones always, expired ones unless
    /// `force` (which evicts all of them, TTL regardless).
    ///
    /// Runs on the background reaper when shrinking is enabled, and with
    /// `force = true` during shutdown. In-use connections are never
    /// touched.
    pub async fn reap(&self, force: bool) {
        let buckets: Vec<Arc<IdentityBucket>> =
            { self.buckets.lock().values().cloned().collect() };

        let mut evicted = 0usize;
        for bucket in buckets {
            for resource in bucket.drain_reapable(force, self.config.idle_ttl) {
                self.destroy(&resource).await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(pool = %self.name, evicted, force, "reaped idle connections");
        }
    }

    /// Shut the pool down.
    ///
    /// Subsequent acquires fail fast; all idle connections are closed now
    /// and in-use ones as they are individually released. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.name, "connection pool shutting down");
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        self.reap(true).await;
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Point-in-time statistics.
    pub fn status(&self) -> PoolStatus {
        self.counters.snapshot()
    }

    /// Average acquire wait in milliseconds.
    pub fn avg_wait_ms(&self) -> f64 {
        self.counters.avg_wait_ms()
    }

    /// Remaining global admission permits. Diagnostic; equals
    /// `max_connections` minus currently leased connections.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Diagnostics for one identity's bucket, if it exists.
    pub fn identity_snapshot(&self, identity: &Identity) -> Option<IdentitySnapshot> {
        self.find_bucket(identity).map(|b| b.snapshot())
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The pool's log label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up or create the identity's bucket under the pool-wide lock;
    /// concurrent first-time callers observe a single bucket.
    fn bucket(&self, identity: &Identity) -> Arc<IdentityBucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(identity.clone())
            .or_insert_with(|| {
                Arc::new(IdentityBucket::new(
                    identity.clone(),
                    self.config.identity_quota(),
                ))
            })
            .clone()
    }

    fn find_bucket(&self, identity: &Identity) -> Option<Arc<IdentityBucket>> {
        self.buckets.lock().get(identity).cloned()
    }

    /// Close a connection and account for its destruction. Close failures
    /// are logged and swallowed; the resource is gone from bookkeeping
    /// either way.
    async fn destroy(&self, resource: &Arc<PooledResource>) {
        if let Err(err) = resource.raw().close().await {
            warn!(pool = %self.name, error = %err, "closing connection failed; discarding it anyway");
        }
        self.counters.record_destroyed();
    }

    /// Advisory over-capacity correction: evict at most one idle
    /// connection, preferring other identities' buckets and falling back
    /// to the creator's own. Best-effort: no ordering across buckets is
    /// promised and the scan may find nothing; the admission semaphores
    /// remain the real limit.
    async fn correct_over_capacity(&self, current: &Identity) {
        let buckets: Vec<Arc<IdentityBucket>> =
            { self.buckets.lock().values().cloned().collect() };

        let others = buckets.iter().filter(|b| b.identity != *current);
        let own = buckets.iter().filter(|b| b.identity == *current);
        for bucket in others.chain(own) {
            if let Some(victim) = bucket.pop_unused() {
                warn!(
                    pool = %self.name,
                    evicted_identity = %bucket.identity,
                    "over capacity after creation; evicting one idle connection"
                );
                self.destroy(&victim).await;
                return;
            }
        }
    }

    fn spawn_reaper(pool: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(pool);
        let period = pool.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                pool.reap(false).await;
            }
        })
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("status", &self.status())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
