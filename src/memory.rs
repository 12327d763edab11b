//! Reference in-memory [`Backend`] implementation.
//!
//! Grounded on `eventually::event::store::InMemory` from the teacher crate:
//! a `HashMap`-backed store guarded by a single lock, generalised here from
//! per-stream versioning to the tenant/DCB model. The single process-wide
//! mutex the spec calls for is a [`parking_lot::RwLock`] (already a
//! dependency of the teacher's root crate): `append` takes the write side
//! for the whole operation, `stream` takes the read side only long enough
//! to snapshot the tenant's events.

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Backend, ConsistencyBoundary};
use crate::error::EventStoreError;
use crate::event::{EventEnvelope, EventToPersist, StoredEvent};
use crate::query::StreamQuery;
use crate::tenant::Tenant;

#[derive(Default)]
struct Inner {
    tenants: HashMap<Tenant, HashMap<Uuid, StoredEvent>>,
    known_ids: HashSet<Uuid>,
    position: i64,
}

impl Inner {
    fn events_for(&self, tenant: &Tenant) -> impl Iterator<Item = &StoredEvent> {
        self.tenants.get(tenant).into_iter().flat_map(HashMap::values)
    }

    fn boundary_violated(&self, tenant: &Tenant, boundary: &ConsistencyBoundary) -> bool {
        let floor = match boundary.expected_last_event_id {
            None => return self.events_for(tenant).any(|e| boundary.query.matches(e)),
            Some(expected_id) => self
                .events_for(tenant)
                .find(|e| e.id == expected_id)
                .map_or(-1, |e| e.position),
        };

        self.events_for(tenant)
            .any(|e| e.position > floor && boundary.query.matches(e))
    }
}

/// In-memory, single-process implementation of [`Backend`].
///
/// Not durable; intended as the reference implementation whose behaviour
/// both the relational backend and client code can be tested against.
#[derive(Default)]
pub struct InMemoryBackend {
    inner: RwLock<Inner>,
}

impl InMemoryBackend {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of events stored for `tenant`. Debugging
    /// accessor; not part of the [`Backend`] contract.
    #[must_use]
    pub fn count(&self, tenant: &Tenant) -> usize {
        self.inner.read().events_for(tenant).count()
    }

    /// Returns `true` if an event with `id` exists anywhere in the store.
    /// Debugging accessor; not part of the [`Backend`] contract.
    #[must_use]
    pub fn contains_id(&self, id: Uuid) -> bool {
        self.inner.read().known_ids.contains(&id)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    type Scope = ();

    async fn stream(
        &self,
        tenant: &Tenant,
        query: &StreamQuery,
        max_count: Option<usize>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if matches!(cancellation, Some(token) if token.is_cancelled()) {
            return Err(EventStoreError::Cancelled);
        }

        let inner = self.inner.read();

        let mut matching: Vec<StoredEvent> = inner
            .events_for(tenant)
            .filter(|event| query.matches(event))
            .cloned()
            .collect();

        matching.sort_by_key(|event| event.position);

        if let Some(max_count) = max_count {
            if max_count > 0 {
                matching.truncate(max_count);
            }
        }

        Ok(matching.into_iter().map(StoredEvent::into_envelope).collect())
    }

    async fn append(
        &self,
        tenant: &Tenant,
        events: Vec<EventToPersist>,
        boundary: Option<ConsistencyBoundary>,
        _scope: Option<&Self::Scope>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        if matches!(cancellation, Some(token) if token.is_cancelled()) {
            return Err(EventStoreError::Cancelled);
        }

        let mut inner = self.inner.write();

        if let Some(boundary) = &boundary {
            if inner.boundary_violated(tenant, boundary) {
                return Err(EventStoreError::ConcurrencyConflict);
            }
        }

        for event in &events {
            if inner.known_ids.contains(&event.id) {
                return Err(EventStoreError::DuplicateEventId(event.id));
            }
        }

        // Cancellation is honoured only between events, never mid-event:
        // every event already visited here has its position stamped and is
        // committed below, so a cancellation observed partway through still
        // yields an all-or-nothing result with respect to any single event.
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            if matches!(cancellation, Some(token) if token.is_cancelled()) {
                return Err(EventStoreError::Cancelled);
            }

            inner.position += 1;
            stored.push(StoredEvent {
                position: inner.position,
                id: event.id,
                tenant: tenant.clone(),
                event_type: event.event_type,
                tags: event.tags,
                payload: event.payload,
                metadata: event.metadata,
                created: event.created,
            });
        }

        let tenant_events = inner.tenants.entry(tenant.clone()).or_default();
        for event in &stored {
            inner.known_ids.insert(event.id);
            tenant_events.insert(event.id, event.clone());
        }

        Ok(stored.into_iter().map(StoredEvent::into_envelope).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTag;
    use crate::event::EventType;
    use std::time::SystemTime;

    fn event(id: Uuid, tags: &[EventTag], event_type: &str) -> EventToPersist {
        EventToPersist::new(
            id,
            EventType::new(event_type).unwrap(),
            b"{}".to_vec(),
            SystemTime::now(),
        )
        .with_tags(tags.iter().cloned())
    }

    fn tenant(name: &str) -> Tenant {
        Tenant::new(name).unwrap()
    }

    #[tokio::test]
    async fn s1_append_one_event_then_stream_by_tag() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let order_123 = EventTag::new("order", "123").unwrap();

        backend
            .append(
                &t,
                vec![event(Uuid::new_v4(), &[order_123.clone()], "order-created")],
                None,
                None,
                None,
            )
            .await
            .expect("append should succeed");

        let query = StreamQuery::new().with_tags([order_123]);
        let result = backend.stream(&t, &query, None, None).await.expect("stream should succeed");

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].position(), 1);
    }

    #[tokio::test]
    async fn s2_append_batch_preserves_order_and_positions() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let tag = EventTag::new("order", "123").unwrap();

        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let events = ids
            .iter()
            .map(|id| event(*id, &[tag.clone()], "order-created"))
            .collect();

        let envelopes = backend
            .append(&t, events, None, None, None)
            .await
            .expect("append should succeed");

        assert_eq!(envelopes.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
        assert_eq!(
            envelopes.iter().map(EventEnvelope::position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn s3_duplicate_event_id_fails_and_does_not_store() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let id = Uuid::new_v4();
        let tag = EventTag::new("order", "123").unwrap();

        backend
            .append(&t, vec![event(id, &[tag.clone()], "order-created")], None, None, None)
            .await
            .expect("first append should succeed");

        let err = backend
            .append(&t, vec![event(id, &[tag], "order-created")], None, None, None)
            .await
            .expect_err("duplicate id should fail");

        assert!(matches!(err, EventStoreError::DuplicateEventId(dup) if dup == id));
        assert_eq!(backend.count(&t), 1);
    }

    #[tokio::test]
    async fn s4_dcb_no_conflict_when_boundary_unchanged() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let tag = EventTag::new("order", "123").unwrap();
        let e1_id = Uuid::new_v4();

        backend
            .append(&t, vec![event(e1_id, &[tag.clone()], "order-created")], None, None, None)
            .await
            .unwrap();

        let boundary = ConsistencyBoundary::new(StreamQuery::new().with_tags([tag.clone()]))
            .expecting_last_event(e1_id);

        let result = backend
            .append(
                &t,
                vec![event(Uuid::new_v4(), &[tag], "order-updated")],
                Some(boundary),
                None,
                None,
            )
            .await
            .expect("no conflict expected");

        assert_eq!(result.len(), 1);
        assert_eq!(backend.count(&t), 2);
    }

    #[tokio::test]
    async fn s5_dcb_conflict_when_boundary_grew() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let tag = EventTag::new("order", "123").unwrap();
        let e1_id = Uuid::new_v4();

        backend
            .append(&t, vec![event(e1_id, &[tag.clone()], "order-created")], None, None, None)
            .await
            .unwrap();
        backend
            .append(&t, vec![event(Uuid::new_v4(), &[tag.clone()], "order-updated")], None, None, None)
            .await
            .unwrap();

        let boundary = ConsistencyBoundary::new(StreamQuery::new().with_tags([tag.clone()]))
            .expecting_last_event(e1_id);

        let err = backend
            .append(&t, vec![event(Uuid::new_v4(), &[tag], "order-updated")], Some(boundary), None, None)
            .await
            .expect_err("conflict expected");

        assert!(matches!(err, EventStoreError::ConcurrencyConflict));
        assert_eq!(backend.count(&t), 2);
    }

    #[tokio::test]
    async fn dcb_expect_none_fails_when_any_event_matches() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let tag = EventTag::new("order", "123").unwrap();

        backend
            .append(&t, vec![event(Uuid::new_v4(), &[tag.clone()], "order-created")], None, None, None)
            .await
            .unwrap();

        let boundary = ConsistencyBoundary::new(StreamQuery::new().with_tags([tag.clone()]));
        let err = backend
            .append(&t, vec![event(Uuid::new_v4(), &[tag], "order-updated")], Some(boundary), None, None)
            .await
            .expect_err("conflict expected");

        assert!(matches!(err, EventStoreError::ConcurrencyConflict));
    }

    #[tokio::test]
    async fn require_all_tags_filters_to_exact_match() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let order = EventTag::new("order", "123").unwrap();
        let product = EventTag::new("product", "456").unwrap();

        backend
            .append(&t, vec![event(Uuid::new_v4(), &[order.clone()], "a")], None, None, None)
            .await
            .unwrap();
        backend
            .append(
                &t,
                vec![event(Uuid::new_v4(), &[order.clone(), product.clone()], "b")],
                None,
                None,
                None,
            )
            .await
            .unwrap();
        backend
            .append(&t, vec![event(Uuid::new_v4(), &[product.clone()], "c")], None, None, None)
            .await
            .unwrap();

        let query = StreamQuery::new()
            .with_tags([order, product])
            .requiring_all_tags();

        let result = backend.stream(&t, &query, None, None).await.unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn s6_max_count_truncates_after_ordering() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let tag = EventTag::new("order", "123").unwrap();

        for _ in 0..5 {
            backend
                .append(&t, vec![event(Uuid::new_v4(), &[tag.clone()], "order-created")], None, None, None)
                .await
                .unwrap();
        }

        let query = StreamQuery::new().with_tags([tag]);
        let result = backend.stream(&t, &query, Some(3), None).await.unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(
            result.iter().map(EventEnvelope::position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn empty_query_matches_nothing() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");

        backend
            .append(&t, vec![event(Uuid::new_v4(), &[], "order-created")], None, None, None)
            .await
            .unwrap();

        let result = backend.stream(&t, &StreamQuery::new(), None, None).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn tenant_isolation_is_enforced() {
        let backend = InMemoryBackend::new();
        let tenant_a = tenant("tenant-a");
        let tenant_b = tenant("tenant-b");
        let tag = EventTag::new("order", "123").unwrap();

        backend
            .append(&tenant_a, vec![event(Uuid::new_v4(), &[tag.clone()], "order-created")], None, None, None)
            .await
            .unwrap();

        let query = StreamQuery::new().with_tags([tag]);
        let result = backend.stream(&tenant_b, &query, None, None).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn metadata_survives_round_trip_and_position_is_added() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");

        let event = event(Uuid::new_v4(), &[], "order-created").with_metadata("source", "checkout");
        backend.append(&t, vec![event], None, None, None).await.unwrap();

        let query = StreamQuery::new().with_event_types([EventType::wildcard()]);
        let result = backend.stream(&t, &query, None, None).await.unwrap();

        assert_eq!(result[0].metadata.get("source").map(String::as_str), Some("checkout"));
        assert_eq!(result[0].metadata.get("_position").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn empty_append_batch_is_a_no_op() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let result = backend.append(&t, vec![], None, None, None).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(backend.count(&t), 0);
    }

    #[tokio::test]
    async fn concurrent_writers_race_on_the_same_boundary() {
        use std::sync::Arc;

        let backend = Arc::new(InMemoryBackend::new());
        let t = tenant("acme");
        let tag = EventTag::new("order", "123").unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let backend = Arc::clone(&backend);
            let t = t.clone();
            let tag = tag.clone();
            handles.push(tokio::spawn(async move {
                let boundary = ConsistencyBoundary::new(StreamQuery::new().with_tags([tag.clone()]));
                backend
                    .append(&t, vec![event(Uuid::new_v4(), &[tag], "order-created")], Some(boundary), None, None)
                    .await
            }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(EventStoreError::ConcurrencyConflict) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 15);
        assert_eq!(backend.count(&t), 1);
    }

    #[tokio::test]
    async fn cancelled_token_is_honoured_before_append_and_stream() {
        let backend = InMemoryBackend::new();
        let t = tenant("acme");
        let token = CancellationToken::new();
        token.cancel();

        let err = backend
            .append(&t, vec![event(Uuid::new_v4(), &[], "order-created")], None, None, Some(&token))
            .await
            .expect_err("cancelled token should short-circuit append");
        assert!(matches!(err, EventStoreError::Cancelled));
        assert_eq!(backend.count(&t), 0);

        let err = backend
            .stream(&t, &StreamQuery::new().with_event_types([EventType::wildcard()]), None, Some(&token))
            .await
            .expect_err("cancelled token should short-circuit stream");
        assert!(matches!(err, EventStoreError::Cancelled));
    }
}
