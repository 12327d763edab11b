//! Translation of [`StreamQuery`] and [`ConsistencyBoundary`] into SQL
//! predicates, as specified in `spec.md` §4.4.
//!
//! Grounded on `eventually-postgres`'s sqlx-era query construction
//! (`sqlx::query(...).bind(...)`) for the general shape, and on the DCB
//! reference file `disintegrate-postgres`'s `CriteriaBuilder` (kept in
//! `examples/other_examples/`) for the idea of building the predicate
//! incrementally against a query builder rather than string-concatenating
//! bind placeholders by hand.

use dcb_eventstore::backend::ConsistencyBoundary;
use dcb_eventstore::event::EventTag;
use dcb_eventstore::query::StreamQuery;
use dcb_eventstore::tenant::Tenant;
use sqlx::{Postgres, QueryBuilder};

fn tags_as_strings(query: &StreamQuery) -> Vec<String> {
    let mut tags: Vec<String> = query.tags().iter().map(EventTag::canonical).collect();
    tags.sort();
    tags
}

fn types_as_strings(query: &StreamQuery) -> Vec<String> {
    let mut types: Vec<String> = query.event_types().iter().map(ToString::to_string).collect();
    types.sort();
    types
}

/// Pushes `AND <tag/type predicate>` for `query` onto `builder`.
///
/// An empty query pushes `AND FALSE`: the Open Question in `spec.md` §9
/// about the empty query's behaviour is resolved here to match the
/// in-memory backend uniformly (matches nothing), rather than the
/// "returns all tenant rows" behaviour the unreconciled original had.
pub(crate) fn push_query_predicate<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a StreamQuery) {
    if query.is_empty() {
        builder.push(" AND FALSE");
        return;
    }

    let wildcard_type = query.event_types().iter().any(dcb_eventstore::event::EventType::is_wildcard);

    if !query.tags().is_empty() {
        let tags = tags_as_strings(query);
        if query.require_all_tags() {
            builder.push(" AND tags @> ");
        } else {
            builder.push(" AND tags && ");
        }
        builder.push_bind(tags);
    }

    if !query.event_types().is_empty() && !wildcard_type {
        let types = types_as_strings(query);
        if types.len() == 1 {
            builder.push(" AND event_type = ");
            builder.push_bind(types.into_iter().next().expect("non-empty"));
        } else if query.require_all_event_types() {
            // |types| > 1 with an exact-match requirement is unsatisfiable
            // for a single event (spec.md §3 invariant 6).
            builder.push(" AND FALSE");
        } else {
            builder.push(" AND event_type = ANY(");
            builder.push_bind(types);
            builder.push(")");
        }
    }
}

/// Pushes the full `stream` predicate: `tenant_id = ? AND <query predicate>`.
pub(crate) fn push_stream_predicate<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    tenant: &'a Tenant,
    query: &'a StreamQuery,
) {
    builder.push("tenant_id = ");
    builder.push_bind(tenant.as_str());
    push_query_predicate(builder, query);
}

/// Pushes the full consistency-boundary predicate used inside the atomic
/// append's `EXISTS` check: `tenant_id = ? AND <floor> AND <query predicate>`.
pub(crate) fn push_consistency_predicate<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    tenant: &'a Tenant,
    boundary: &'a ConsistencyBoundary,
) {
    builder.push("tenant_id = ");
    builder.push_bind(tenant.as_str());

    match boundary.expected_last_event_id {
        Some(expected_id) => {
            builder.push(" AND position > COALESCE((SELECT position FROM events WHERE tenant_id = ");
            builder.push_bind(tenant.as_str());
            builder.push(" AND id = ");
            builder.push_bind(expected_id);
            builder.push("), -1)");
        },
        None => {
            // Matches any row: spec.md §9 recommends `TRUE` over the
            // original `position >= 0`, which interacted confusingly with
            // the `position > 0` partial index filter.
            builder.push(" AND TRUE");
        },
    }

    push_query_predicate(builder, &boundary.query);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcb_eventstore::event::EventType;

    #[test]
    fn empty_query_pushes_and_false() {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE ");
        let query = StreamQuery::new();
        push_query_predicate(&mut builder, &query);
        assert!(builder.sql().ends_with("AND FALSE"));
    }

    #[test]
    fn single_type_uses_equality() {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE ");
        let query = StreamQuery::new().with_event_types([EventType::new("order-created").unwrap()]);
        push_query_predicate(&mut builder, &query);
        assert!(builder.sql().contains("event_type = "));
    }
}
