//! Caller-facing pooled connector
//!
//! [`PooledConnector`] is the entry point query execution goes through: it
//! composes one plain [`ResourcePool`] and, when the driver supports XA,
//! one transactional pool plus the [`TransactionBinder`]. Callers check
//! out a [`PooledConnection`] guard, work against the raw connection, and
//! either release it explicitly or let the guard's drop return it.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::connection::{ConnectionFactory, RawConnection};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::pool::{IdentitySnapshot, PoolConfig, PoolStatus, ResourcePool};
use crate::resource::PooledResource;
use crate::xa::{TransactionBinder, TransactionManager, TxnId};

/// Pooled access to one backing data source, transactional and not.
pub struct PooledConnector {
    pool: Arc<ResourcePool>,
    xa: Option<XaRuntime>,
    manager: Arc<dyn TransactionManager>,
    /// Self reference for creating checkout guards
    self_ref: tokio::sync::OnceCell<Weak<Self>>,
}

struct XaRuntime {
    pool: Arc<ResourcePool>,
    binder: Arc<TransactionBinder>,
}

impl PooledConnector {
    /// Build the connector for one data source.
    ///
    /// Both pools share the same configuration; the XA pool and binder
    /// only exist when the factory reports XA support.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        manager: Arc<dyn TransactionManager>,
    ) -> Result<Arc<Self>> {
        let pool = ResourcePool::new(config.clone(), factory.clone())?;
        let xa = if factory.supports_xa() {
            let xa_pool = ResourcePool::new_xa(config, factory)?;
            Some(XaRuntime {
                binder: TransactionBinder::new(xa_pool.clone()),
                pool: xa_pool,
            })
        } else {
            None
        };

        let connector = Arc::new(Self {
            pool,
            xa,
            manager,
            self_ref: tokio::sync::OnceCell::new(),
        });
        let _ = connector.self_ref.set(Arc::downgrade(&connector));
        Ok(connector)
    }

    /// Check out a connection outside any distributed transaction.
    pub async fn acquire(&self, identity: &Identity) -> Result<PooledConnection> {
        let connector = self.get_self_arc()?;
        let resource = self.pool.acquire(identity).await?;
        Ok(PooledConnection::new(resource, connector))
    }

    /// Check out the connection serving a distributed transaction.
    ///
    /// All acquisitions for one `txn` resolve to the same physical
    /// connection; it returns to the pool only after the transaction
    /// manager fires the completion callback and the last lease ends.
    pub async fn acquire_for_transaction(
        &self,
        identity: &Identity,
        txn: &TxnId,
    ) -> Result<PooledConnection> {
        let Some(xa) = &self.xa else {
            return Err(Error::transaction(format!(
                "data source {} does not support distributed transactions",
                self.pool.name()
            )));
        };
        let connector = self.get_self_arc()?;
        let resource = xa
            .binder
            .acquire_for_transaction(identity, txn, self.manager.as_ref())
            .await?;
        Ok(PooledConnection::new(resource, connector))
    }

    /// End one logical lease on a resource.
    ///
    /// The connection goes back to its pool when this was the last lease
    /// and no transaction holds it; otherwise the return is deferred.
    /// `force_close` condemns the connection either way: it will be
    /// destroyed instead of reused once it is finally released.
    pub async fn release(&self, resource: &Arc<PooledResource>, force_close: bool) {
        if force_close {
            resource.mark_dead();
        }
        if resource.finish_lease() {
            self.owning_pool(resource)
                .release(resource, force_close)
                .await;
        } else {
            debug!(
                identity = %resource.identity(),
                leases = resource.lease_count(),
                in_transaction = resource.in_transaction(),
                "lease ended; connection stays checked out"
            );
        }
    }

    /// Shut down both pools. Subsequent acquires fail fast.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        if let Some(xa) = &self.xa {
            xa.pool.shutdown().await;
        }
    }

    /// Whether a transactional pool exists for this data source.
    pub fn supports_xa(&self) -> bool {
        self.xa.is_some()
    }

    /// Statistics of the non-transactional pool.
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Statistics of the transactional pool, when one exists.
    pub fn xa_status(&self) -> Option<PoolStatus> {
        self.xa.as_ref().map(|xa| xa.pool.status())
    }

    /// Per-identity diagnostics of the non-transactional pool.
    pub fn identity_snapshot(&self, identity: &Identity) -> Option<IdentitySnapshot> {
        self.pool.identity_snapshot(identity)
    }

    /// Per-identity diagnostics of the transactional pool.
    pub fn xa_identity_snapshot(&self, identity: &Identity) -> Option<IdentitySnapshot> {
        self.xa
            .as_ref()
            .and_then(|xa| xa.pool.identity_snapshot(identity))
    }

    /// The non-transactional pool.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// The transactional pool, when one exists.
    pub fn xa_pool(&self) -> Option<&Arc<ResourcePool>> {
        self.xa.as_ref().map(|xa| &xa.pool)
    }

    /// The transaction binder, when XA is supported.
    pub fn binder(&self) -> Option<&Arc<TransactionBinder>> {
        self.xa.as_ref().map(|xa| &xa.binder)
    }

    fn owning_pool(&self, resource: &Arc<PooledResource>) -> &Arc<ResourcePool> {
        match &self.xa {
            Some(xa) if resource.is_xa() => &xa.pool,
            _ => &self.pool,
        }
    }

    /// The connector as an `Arc`, for handing to checkout guards.
    fn get_self_arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .get()
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| Error::internal("connector has been dropped"))
    }
}

impl std::fmt::Debug for PooledConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnector")
            .field("pool", &self.pool.name())
            .field("supports_xa", &self.supports_xa())
            .finish()
    }
}

/// A connection checked out from a [`PooledConnector`].
///
/// Ends its lease on [`release`](Self::release) or, failing that, when
/// dropped (the drop path spawns the non-forced release). Dropping after
/// an explicit release is a no-op.
pub struct PooledConnection {
    resource: Option<Arc<PooledResource>>,
    connector: Arc<PooledConnector>,
}

impl PooledConnection {
    fn new(resource: Arc<PooledResource>, connector: Arc<PooledConnector>) -> Self {
        Self {
            resource: Some(resource),
            connector,
        }
    }

    /// The pooled resource behind this checkout.
    pub fn resource(&self) -> &Arc<PooledResource> {
        self.resource.as_ref().expect("connection already released")
    }

    /// The underlying raw connection.
    pub fn raw(&self) -> &(dyn RawConnection + 'static) {
        self.resource().raw()
    }

    /// End this lease explicitly.
    pub async fn release(mut self, force_close: bool) {
        if let Some(resource) = self.resource.take() {
            self.connector.release(&resource, force_close).await;
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn RawConnection;

    fn deref(&self) -> &Self::Target {
        self.raw()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let connector = self.connector.clone();
            tokio::spawn(async move {
                connector.release(&resource, false).await;
            });
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("resource", &self.resource)
            .finish()
    }
}
