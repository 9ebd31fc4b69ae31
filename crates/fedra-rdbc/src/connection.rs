//! Connection contracts for fedra-rdbc
//!
//! Boundary traits consumed by the pooling core:
//! - [`RawConnection`]: an opaque physical data-source connection
//! - [`ConnectionFactory`]: driver-supplied creation of raw connections
//! - [`XaResource`]: opaque two-phase-commit handle for XA-capable drivers
//!
//! The pool never interprets what a connection *is*: drivers for specific
//! backends (PostgreSQL, MySQL, Salesforce, …) implement these traits and
//! keep wire protocols, dialects, and authentication to themselves.

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::Identity;

/// Opaque transaction-resource handle of an XA-capable connection.
///
/// The pool only cares that one exists; enlistment with the transaction
/// manager happens in the driver/engine layers above.
pub trait XaResource: Send + Sync {}

/// A physical connection to a backing data source.
///
/// The pool treats it as an opaque, expensive, stateful resource with a
/// liveness probe and a close operation. Everything else (queries, cursors,
/// metadata) lives on the driver's own connection type.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Probe whether the connection is still usable.
    ///
    /// This goes to the backing store and has real cost; the pool throttles
    /// calls to it via `liveness_interval`.
    async fn is_valid(&self) -> bool;

    /// Close the connection, releasing backend resources.
    async fn close(&self) -> Result<()>;

    /// The two-phase-commit handle, if this connection is XA-capable.
    fn xa_resource(&self) -> Option<&dyn XaResource> {
        None
    }
}

/// Factory for creating raw connections, implemented per backend driver.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new physical connection under the given identity's
    /// credentials.
    async fn open(&self, identity: &Identity) -> Result<Box<dyn RawConnection>>;

    /// Whether connections from this factory carry an XA resource.
    fn supports_xa(&self) -> bool {
        false
    }

    /// Label of the backing data source, used in logs and diagnostics.
    fn source_name(&self) -> &str;
}
