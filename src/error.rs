//! Error taxonomy for the DCB event store.

use thiserror::Error;

/// All errors that can be returned by a [`crate::backend::Backend`]
/// implementation.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The consistency boundary supplied to `append` was violated: an event
    /// matching the boundary was committed after the caller last observed
    /// it. The store is left unchanged.
    #[error("concurrency conflict: the consistency boundary was violated")]
    ConcurrencyConflict,

    /// An `append` batch contained an event id that is already present in
    /// the store. The store is left unchanged.
    #[error("duplicate event id: {0}")]
    DuplicateEventId(uuid::Uuid),

    /// An [`crate::event::EventTag`] failed validation.
    #[error("invalid event tag: {0}")]
    InvalidTag(String),

    /// An [`crate::event::EventType`] failed validation.
    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    /// An I/O or database error not classifiable as one of the above.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The operation was cancelled before it completed. Never raised
    /// alongside one of the other variants.
    #[error("operation cancelled")]
    Cancelled,
}

impl EventStoreError {
    /// Wraps an arbitrary I/O or database error as a [`EventStoreError::Backend`].
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}
