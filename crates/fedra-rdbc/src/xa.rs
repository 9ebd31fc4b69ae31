//! Distributed-transaction leasing
//!
//! Inside one distributed (XA) transaction every logical checkout must
//! resolve to the same physical connection, and that connection goes back
//! to its pool exactly once, when the transaction's completion callback
//! fires and the last logical lease has ended.
//!
//! [`TransactionBinder`] keeps the txn→connection map;
//! [`TransactionCompletion`] is the callback handle registered with the
//! external transaction manager. The manager is contracted to invoke it
//! exactly once per transaction outcome, and the handle guards against
//! duplicates anyway.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::identity::Identity;
use crate::pool::ResourcePool;
use crate::resource::PooledResource;

/// Distributed-transaction identifier.
///
/// Opaque to the pooling core; equality and hashing are all it needs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(Arc<str>);

impl TxnId {
    /// Create a transaction id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({})", self.0)
    }
}

impl From<&str> for TxnId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TxnId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Transaction-manager contract (consumed, not implemented, by this crate).
///
/// The engine's transaction layer implements this; the binder registers one
/// [`TransactionCompletion`] per transaction and expects it to be fired
/// exactly once, at commit or rollback, regardless of outcome.
pub trait TransactionManager: Send + Sync {
    /// Register the completion callback for `txn`.
    fn register_completion(&self, txn: &TxnId, completion: TransactionCompletion);
}

/// Single-fire completion handle for one transaction.
///
/// Cloneable so the transaction manager can pass it around; all clones
/// share the fired flag, and only the first [`fire`](Self::fire) across
/// them has any effect.
#[derive(Clone)]
pub struct TransactionCompletion {
    txn: TxnId,
    binder: Weak<TransactionBinder>,
    fired: Arc<AtomicBool>,
}

impl TransactionCompletion {
    /// Invoke at commit or rollback, regardless of outcome.
    ///
    /// Unbinds the transaction's connection and returns it to its pool
    /// once no logical leases remain. Duplicate invocations are no-ops.
    pub async fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(txn = %self.txn, "duplicate transaction completion ignored");
            return;
        }
        if let Some(binder) = self.binder.upgrade() {
            binder.complete(&self.txn).await;
        }
    }

    /// The transaction this completion belongs to.
    pub fn txn_id(&self) -> &TxnId {
        &self.txn
    }

    /// Whether the completion has already fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TransactionCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCompletion")
            .field("txn", &self.txn)
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// Maps each active distributed transaction to the single pooled
/// connection leased to it.
///
/// At most one live mapping per transaction id at any time. Entries are
/// created on first transactional acquisition and removed exactly once by
/// the completion callback.
pub struct TransactionBinder {
    pool: Arc<ResourcePool>,
    bindings: Mutex<HashMap<TxnId, Arc<PooledResource>>>,
    /// Self reference for handing a weak backpointer to completions
    self_ref: tokio::sync::OnceCell<Weak<Self>>,
}

impl TransactionBinder {
    /// Create a binder over the XA pool.
    pub fn new(pool: Arc<ResourcePool>) -> Arc<Self> {
        let binder = Arc::new(Self {
            pool,
            bindings: Mutex::new(HashMap::new()),
            self_ref: tokio::sync::OnceCell::new(),
        });
        let _ = binder.self_ref.set(Arc::downgrade(&binder));
        binder
    }

    /// Check out the transaction's connection.
    ///
    /// A transaction that already holds one gets the identical instance
    /// back with one more logical lease and no pool interaction. The first
    /// acquisition for a transaction goes through the pool, binds the
    /// result, and registers the completion callback with `manager`.
    pub async fn acquire_for_transaction(
        &self,
        identity: &Identity,
        txn: &TxnId,
        manager: &dyn TransactionManager,
    ) -> Result<Arc<PooledResource>> {
        if let Some(existing) = self.bindings.lock().get(txn).cloned() {
            existing.lease();
            debug!(txn = %txn, leases = existing.lease_count(), "re-leasing transaction-bound connection");
            return Ok(existing);
        }

        let resource = self.pool.acquire(identity).await?;
        resource.set_in_transaction(true);

        // The pool acquire suspends, so another first lease for this txn
        // may have bound a connection meanwhile. Transaction managers
        // serialize a transaction's work, but don't rely on it.
        let raced = {
            let mut bindings = self.bindings.lock();
            match bindings.get(txn) {
                Some(existing) => Some(existing.clone()),
                None => {
                    bindings.insert(txn.clone(), resource.clone());
                    None
                }
            }
        };

        if let Some(existing) = raced {
            resource.set_in_transaction(false);
            if resource.finish_lease() {
                self.pool.release(&resource, false).await;
            }
            existing.lease();
            return Ok(existing);
        }

        manager.register_completion(
            txn,
            TransactionCompletion {
                txn: txn.clone(),
                binder: self.self_ref.get().cloned().unwrap_or_else(Weak::new),
                fired: Arc::new(AtomicBool::new(false)),
            },
        );
        debug!(txn = %txn, identity = %identity, "bound connection to transaction");
        Ok(resource)
    }

    /// Transaction completion.
    ///
    /// Removes the mapping, clears the binding, drops the transaction's
    /// hold, and returns the connection to its pool when no logical leases
    /// remain. Unknown transaction ids are tolerated as no-ops.
    pub async fn complete(&self, txn: &TxnId) {
        let Some(resource) = self.bindings.lock().remove(txn) else {
            debug!(txn = %txn, "completion for unknown transaction ignored");
            return;
        };

        if resource.complete_transaction() {
            debug!(txn = %txn, "transaction completed; returning connection to pool");
            self.pool.release(&resource, false).await;
        } else {
            debug!(
                txn = %txn,
                leases = resource.lease_count(),
                "transaction completed; connection still leased"
            );
        }
    }

    /// The connection currently bound to `txn`, if any.
    pub fn bound_resource(&self, txn: &TxnId) -> Option<Arc<PooledResource>> {
        self.bindings.lock().get(txn).cloned()
    }

    /// Number of transactions currently holding a connection.
    pub fn active_transactions(&self) -> usize {
        self.bindings.lock().len()
    }

    /// The pool this binder leases from.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }
}

impl fmt::Debug for TransactionBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBinder")
            .field("active_transactions", &self.active_transactions())
            .finish()
    }
}
