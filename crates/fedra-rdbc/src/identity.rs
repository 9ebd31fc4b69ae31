//! Identity keys partitioning the pool
//!
//! An [`Identity`] names the security/credential context a physical
//! connection was created under. Two acquisitions with equal identities may
//! share pooled connections; unequal identities never do.

use std::fmt;
use std::sync::Arc;

/// Shared identity name used when the engine runs every query under one
/// service credential rather than per-user credentials.
const SHARED: &str = "__shared__";

/// Equality- and hash-comparable credential-context key.
///
/// Cheap to clone (`Arc<str>` inside); used as the key of the pool's
/// identity→bucket map. Typically either a single shared identity
/// ([`Identity::shared`]) or one identity per end user.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Create an identity from a principal name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The single shared service identity.
    pub fn shared() -> Self {
        Self(Arc::from(SHARED))
    }

    /// Whether this is the shared service identity.
    pub fn is_shared(&self) -> bool {
        &*self.0 == SHARED
    }

    /// The principal name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}
