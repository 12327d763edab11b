//! Integration tests against a real Postgres instance.
//!
//! These are gated behind `#[ignore]`, the way `eventually-postgres`'s own
//! `tests/` gate theirs: run explicitly with
//! `cargo test -- --ignored` against a `DATABASE_URL` pointing at a
//! disposable database, never as part of the default unit-test run.

use std::collections::HashSet;
use std::time::SystemTime;

use dcb_eventstore::backend::{Backend, ConsistencyBoundary};
use dcb_eventstore::error::EventStoreError;
use dcb_eventstore::event::{EventTag, EventToPersist, EventType};
use dcb_eventstore::query::StreamQuery;
use dcb_eventstore::tenant::Tenant;
use dcb_eventstore_postgres::{PgConfig, PostgresBackend};
use uuid::Uuid;

async fn connect() -> PostgresBackend {
    let connection_string = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set to run postgres integration tests");
    let config = PgConfig::new(connection_string).with_schema(format!("test_{}", Uuid::new_v4().simple()));
    PostgresBackend::connect(config).await.expect("failed to connect to postgres")
}

fn event(event_type: &str, tags: impl IntoIterator<Item = (&'static str, &'static str)>) -> EventToPersist {
    EventToPersist::new(Uuid::new_v4(), EventType::new(event_type).unwrap(), b"{}".to_vec(), SystemTime::now())
        .with_tags(tags.into_iter().map(|(c, i)| EventTag::new(c, i).unwrap()))
}

#[tokio::test]
#[ignore]
async fn append_then_stream_round_trips() {
    let backend = connect().await;
    let tenant = Tenant::new("acme").unwrap();

    let appended = backend
        .append(&tenant, vec![event("order-created", [("order", "1")])], None, None, None)
        .await
        .expect("append should succeed");
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].position(), 1);

    let query = StreamQuery::new().with_tags([EventTag::new("order", "1").unwrap()]);
    let streamed = backend.stream(&tenant, &query, None, None).await.expect("stream should succeed");
    assert_eq!(streamed.len(), 1);
    assert_eq!(streamed[0].id, appended[0].id);
}

#[tokio::test]
#[ignore]
async fn duplicate_id_is_rejected() {
    let backend = connect().await;
    let tenant = Tenant::new("acme").unwrap();
    let duplicate = event("order-created", [("order", "1")]);
    let id = duplicate.id;

    backend.append(&tenant, vec![duplicate.clone()], None, None, None).await.expect("first append succeeds");

    let retry = EventToPersist {
        id,
        ..event("order-created", [("order", "1")])
    };
    let result = backend.append(&tenant, vec![retry], None, None, None).await;
    assert!(matches!(result, Err(EventStoreError::DuplicateEventId(dup)) if dup == id));
}

#[tokio::test]
#[ignore]
async fn consistency_boundary_blocks_conflicting_append() {
    let backend = connect().await;
    let tenant = Tenant::new("acme").unwrap();

    backend
        .append(&tenant, vec![event("order-created", [("order", "1")])], None, None, None)
        .await
        .expect("seed append succeeds");

    let boundary = ConsistencyBoundary::new(StreamQuery::new().with_tags([EventTag::new("order", "1").unwrap()]));

    let result = backend
        .append(&tenant, vec![event("order-shipped", [("order", "1")])], Some(boundary), None, None)
        .await;

    assert!(matches!(result, Err(EventStoreError::ConcurrencyConflict)));
}

#[tokio::test]
#[ignore]
async fn bulk_insert_path_assigns_contiguous_positions() {
    let backend = connect().await;
    let tenant = Tenant::new("acme").unwrap();

    let batch: Vec<_> = (0..10).map(|i| event("order-created", [("order", "batch")]).with_tags([EventTag::new("seq", &i.to_string()).unwrap()])).collect();

    let appended = backend.append(&tenant, batch, None, None, None).await.expect("bulk append succeeds");
    let positions: Vec<i64> = appended.iter().map(|e| e.position()).collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
    assert_eq!(positions.len(), 10);
}

#[tokio::test]
#[ignore]
async fn tenant_isolation_holds_across_streams() {
    let backend = connect().await;
    let acme = Tenant::new("acme").unwrap();
    let globex = Tenant::new("globex").unwrap();

    backend.append(&acme, vec![event("order-created", [("order", "1")])], None, None, None).await.unwrap();

    let query = StreamQuery::new().with_event_types([EventType::new("order-created").unwrap()]);
    let globex_events = backend.stream(&globex, &query, None, None).await.unwrap();
    assert!(globex_events.is_empty());

    let tags_seen: HashSet<_> = backend
        .stream(&acme, &query, None, None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(tags_seen.len(), 1);
}
