//! # fedra-rdbc
//!
//! Pooled data-source connectivity for the Fedra data virtualization engine.
//!
//! Fedra routes queries to heterogeneous backing stores through
//! connector-specific drivers; this crate is the broker those drivers sit
//! behind. A physical data-source connection is scarce, expensive, and
//! stateful; the pool's job is to share it safely across many concurrent
//! query executions, multiple credential contexts, and distributed (XA)
//! transactions.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a fair global semaphore caps connections
//!   across the whole pool; waiters are admitted in arrival order
//! - **Identity partitioning**: connections are never shared across
//!   credential contexts, with optional per-identity sub-quotas
//! - **Safe reuse**: idle connections are reused first-idle-first, behind
//!   a throttled liveness check that cannot flood the backing store
//! - **Background reaping**: a reaper task evicts idle and dead
//!   connections independent of foreground traffic
//! - **Transaction-scoped leasing**: one connection serves all work inside
//!   a distributed transaction and is released exactly once when the
//!   transaction completes
//! - **Predictable backpressure**: acquisition waits are bounded by a
//!   single deadline across every admission limit
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fedra_rdbc::prelude::*;
//!
//! let connector = PooledConnector::new(
//!     PoolConfig::default()
//!         .with_max_connections(20)
//!         .with_max_connections_per_identity(5),
//!     Arc::new(PgConnectionFactory::new(driver_config)),
//!     txn_manager,
//! )?;
//!
//! // Plain checkout: released on drop, or explicitly.
//! let conn = connector.acquire(&Identity::new("alice")).await?;
//! conn.release(false).await;
//!
//! // Transactional checkout: every acquisition inside txn-A gets the
//! // same physical connection.
//! let conn = connector
//!     .acquire_for_transaction(&Identity::new("alice"), &TxnId::new("txn-A"))
//!     .await?;
//! ```
//!
//! Backend drivers implement [`connection::ConnectionFactory`] and
//! [`connection::RawConnection`]; the engine's transaction layer
//! implements [`xa::TransactionManager`]. The pool treats both as opaque
//! collaborators.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod connector;
pub mod error;
pub mod identity;
pub mod pool;
pub mod resource;
pub mod xa;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, ExhaustionScope, Result};

    // Identity keys
    pub use crate::identity::Identity;

    // Boundary contracts
    pub use crate::connection::{ConnectionFactory, RawConnection, XaResource};

    // Pool types
    pub use crate::pool::{
        AtomicPoolCounters, IdentitySnapshot, PoolConfig, PoolStatus, ResourcePool,
    };

    // Resource wrapper
    pub use crate::resource::PooledResource;

    // Distributed transactions
    pub use crate::xa::{TransactionBinder, TransactionCompletion, TransactionManager, TxnId};

    // Caller-facing facade
    pub use crate::connector::{PooledConnection, PooledConnector};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use identity::Identity;
