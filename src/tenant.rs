//! `Tenant` identifies the isolation boundary every operation is scoped by.

use std::fmt;

/// An opaque, non-empty tenant identifier.
///
/// The store never crosses tenants in a single `stream` or `append` call:
/// every [`crate::backend::Backend`] method takes a `&Tenant` and scopes its
/// work to it alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tenant(String);

impl Tenant {
    /// Builds a new `Tenant` from a non-empty identifier.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::EventStoreError::InvalidEventType`]-shaped
    /// validation is not performed here: a `Tenant` has no format beyond
    /// "non-empty", so an empty string is simply rejected with `None`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() {
            return None;
        }
        Some(Self(id))
    }

    /// Returns the tenant identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tenant {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
