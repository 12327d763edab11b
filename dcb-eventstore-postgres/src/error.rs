//! Classification of raw `sqlx` errors into [`dcb_eventstore::EventStoreError`].
//!
//! Grounded on `eventually-postgres`'s `check_for_conflict_error` helper,
//! which inspects a raw SQL error's code to decide whether it represents a
//! domain-level conflict rather than an opaque backend failure.

use dcb_eventstore::EventStoreError;

/// Postgres error code for a unique-constraint violation (the `id` column).
const UNIQUE_VIOLATION: &str = "23505";

/// Classifies a raw `sqlx::Error` as a [`EventStoreError`], recognising a
/// unique-constraint violation on `events.id` as
/// [`EventStoreError::DuplicateEventId`] when `duplicate_id` is known, and
/// otherwise wrapping it as [`EventStoreError::Backend`].
pub(crate) fn classify(err: sqlx::Error, duplicate_id: Option<uuid::Uuid>) -> EventStoreError {
    if let Some(id) = duplicate_id {
        if is_unique_violation(&err) {
            return EventStoreError::DuplicateEventId(id);
        }
    }

    EventStoreError::backend(err)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|err| err.code()),
        Some(code) if code == UNIQUE_VIOLATION
    )
}
