//! The backend contract: `stream` and `append` with DCB.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EventStoreError;
use crate::event::{EventEnvelope, EventToPersist};
use crate::query::StreamQuery;
use crate::tenant::Tenant;
use uuid::Uuid;

/// The consistency boundary predicate supplied to `append`.
///
/// Pairs a [`StreamQuery`] (the set of events whose presence would
/// invalidate the writer's decision) with an optional "last observed event"
/// id, narrowing the check to events committed *after* that one.
#[derive(Debug, Clone)]
pub struct ConsistencyBoundary {
    /// The predicate describing the events that must not have grown.
    pub query: StreamQuery,
    /// If set, only events committed after this one (by position) count
    /// against the boundary; if the id is not found, the check degenerates
    /// to "no matching events at all" (its position treated as `-1`).
    pub expected_last_event_id: Option<Uuid>,
}

impl ConsistencyBoundary {
    /// Builds a boundary with no "last observed event" (the insert
    /// succeeds only if `query` currently matches no events at all).
    #[must_use]
    pub fn new(query: StreamQuery) -> Self {
        Self {
            query,
            expected_last_event_id: None,
        }
    }

    /// Narrows the boundary to events committed after `event_id`.
    #[must_use]
    pub fn expecting_last_event(mut self, event_id: Uuid) -> Self {
        self.expected_last_event_id = Some(event_id);
        self
    }
}

/// The two tenant-scoped operations every storage implementation supports.
///
/// `Scope` stands in for an ambient connection+transaction handle (see
/// `spec.md` §4.5): the in-memory backend has no use for one and sets it to
/// `()`, while the relational backend uses it to let nested `append` calls
/// share a transaction.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The type of an ambient transaction scope this backend understands.
    type Scope: Send + Sync;

    /// Returns all stored events of `tenant` matching `query`, ordered by
    /// ascending position. If `max_count` is `Some` and greater than zero,
    /// truncates to the first `max_count` after ordering.
    ///
    /// `cancellation`, if given, is observed between units of work (see
    /// `spec.md` §5); a token cancelled before the call returns yields
    /// [`EventStoreError::Cancelled`] rather than a partial result.
    async fn stream(
        &self,
        tenant: &Tenant,
        query: &StreamQuery,
        max_count: Option<usize>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Appends `events` to `tenant`, honouring `boundary` if supplied.
    ///
    /// An empty `events` batch returns an empty result without side
    /// effects. All events are inserted under a single atomic unit: either
    /// all positions are assigned contiguously with respect to the
    /// in-database sequence, or none are. See `spec.md` §4.2 for the full
    /// contract.
    ///
    /// `cancellation`, if given and observed to be cancelled before commit,
    /// rolls back any in-progress transaction and returns
    /// [`EventStoreError::Cancelled`]; once committed, cancellation is a
    /// no-op on state (`spec.md` §5).
    async fn append(
        &self,
        tenant: &Tenant,
        events: Vec<EventToPersist>,
        boundary: Option<ConsistencyBoundary>,
        scope: Option<&Self::Scope>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;
}
