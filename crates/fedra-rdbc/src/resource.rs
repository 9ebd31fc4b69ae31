//! Pooled connection wrapper
//!
//! [`PooledResource`] owns exactly one raw connection and carries the
//! bookkeeping the pool needs around it: lease count, liveness state, idle
//! timestamps, and distributed-transaction binding.
//!
//! Lease counting is a business concept here, not thread re-entrancy: one
//! physical connection may serve several overlapping logical checkouts
//! inside a single distributed transaction, and must go back to the pool
//! exactly once when the last of them ends. The count is a plain integer
//! guarded by the resource's own lock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::{RawConnection, XaResource};
use crate::identity::Identity;

/// One pooled physical connection plus its pool-side bookkeeping.
///
/// Owned by exactly one bucket list (`used` or `unused`) at a time, except
/// during the brief windows of creation and destruction. All mutable state
/// sits behind a short-lived internal lock; the liveness probe itself runs
/// outside it.
pub struct PooledResource {
    conn: Box<dyn RawConnection>,
    created_at: Instant,
    xa: bool,
    state: Mutex<ResourceState>,
}

struct ResourceState {
    identity: Identity,
    lease_count: u32,
    dead: bool,
    in_transaction: bool,
    last_probe: Instant,
    last_alive: bool,
    returned_at: Instant,
}

impl PooledResource {
    /// Wrap a freshly opened connection.
    ///
    /// A new connection counts as just-probed: it is not re-probed until
    /// `liveness_interval` has elapsed from creation.
    pub(crate) fn new(conn: Box<dyn RawConnection>, identity: Identity, xa: bool) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            xa,
            state: Mutex::new(ResourceState {
                identity,
                lease_count: 0,
                dead: false,
                in_transaction: false,
                last_probe: now,
                last_alive: true,
                returned_at: now,
            }),
        }
    }

    /// Access the underlying raw connection.
    pub fn raw(&self) -> &(dyn RawConnection + 'static) {
        self.conn.as_ref()
    }

    /// The two-phase-commit handle, if the underlying connection has one.
    pub fn xa_resource(&self) -> Option<&dyn XaResource> {
        self.conn.xa_resource()
    }

    /// Whether this resource belongs to the XA pool.
    pub fn is_xa(&self) -> bool {
        self.xa
    }

    /// The identity this connection is currently bound to.
    pub fn identity(&self) -> Identity {
        self.state.lock().identity.clone()
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last returned to the pool.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().returned_at.elapsed()
    }

    /// Whether the connection has been marked unusable.
    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// Whether the resource is currently bound to a distributed transaction.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    /// Current number of outstanding logical leases.
    pub fn lease_count(&self) -> u32 {
        self.state.lock().lease_count
    }

    /// Mark the connection unusable. Sticky: it will be destroyed instead
    /// of returned to `unused` at the next ownership transition.
    pub fn mark_dead(&self) {
        self.state.lock().dead = true;
    }

    /// Throttled liveness check.
    ///
    /// Returns `false` immediately once the resource is dead. Otherwise the
    /// underlying probe only runs when `probe_interval` has elapsed since
    /// the previous one; between probes the cached result is returned. A
    /// failed probe marks the resource dead.
    ///
    /// Two callers racing past the throttle window may both probe; the
    /// throttle is best-effort.
    pub async fn is_alive(&self, probe_interval: Duration) -> bool {
        {
            let state = self.state.lock();
            if state.dead {
                return false;
            }
            if state.last_probe.elapsed() < probe_interval {
                return state.last_alive;
            }
        }

        let alive = self.conn.is_valid().await;

        let mut state = self.state.lock();
        state.last_probe = Instant::now();
        state.last_alive = alive;
        if !alive {
            state.dead = true;
        }
        alive
    }

    /// Take one logical lease on this resource.
    pub(crate) fn lease(&self) {
        self.state.lock().lease_count += 1;
    }

    /// End one logical lease.
    ///
    /// Returns `true` when the resource should go back to its pool: no
    /// leases remain and it is not bound to an open transaction. Saturates
    /// at zero so a surplus release stays a no-op.
    pub(crate) fn finish_lease(&self) -> bool {
        let mut state = self.state.lock();
        state.lease_count = state.lease_count.saturating_sub(1);
        state.lease_count == 0 && !state.in_transaction
    }

    /// Bind or unbind the resource to a distributed transaction.
    pub(crate) fn set_in_transaction(&self, bound: bool) {
        self.state.lock().in_transaction = bound;
    }

    /// Transaction completion: drop the transaction's hold.
    ///
    /// Clears the binding, ends the transaction's own lease, and returns
    /// `true` when no logical leases remain and the resource should be
    /// returned to its pool.
    pub(crate) fn complete_transaction(&self) -> bool {
        let mut state = self.state.lock();
        state.in_transaction = false;
        state.lease_count = state.lease_count.saturating_sub(1);
        state.lease_count == 0
    }

    /// Re-associate an idle connection with the identity reusing it.
    pub(crate) fn rebind(&self, identity: Identity) {
        self.state.lock().identity = identity;
    }

    /// Stamp the return-to-pool time and settle any remaining leases.
    /// An idle resource always has zero leases.
    pub(crate) fn touch_returned(&self) {
        let mut state = self.state.lock();
        state.returned_at = Instant::now();
        state.lease_count = 0;
    }

    /// Whether the connection has sat unused longer than `idle_ttl`.
    pub(crate) fn idle_expired(&self, idle_ttl: Duration) -> bool {
        self.state.lock().returned_at.elapsed() >= idle_ttl
    }
}

impl std::fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PooledResource")
            .field("identity", &state.identity)
            .field("lease_count", &state.lease_count)
            .field("dead", &state.dead)
            .field("in_transaction", &state.in_transaction)
            .field("xa", &self.xa)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}
