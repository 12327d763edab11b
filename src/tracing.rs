//! Telemetry hooks: a [`Backend`] decorator opening spans around `stream`
//! and `append`, mirroring the teacher crate's
//! `tracing::InstrumentedEventStore` wrapper. The telemetry layer itself
//! (exporters, sampling, the `tracing-subscriber` pipeline) is an external
//! collaborator (`spec.md` §1); this module only opens the two named spans
//! and attaches the tags the contract calls for.

use async_trait::async_trait;
use opentelemetry::trace::{TraceContextExt, TraceFlags};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::backend::{Backend, ConsistencyBoundary};
use crate::error::EventStoreError;
use crate::event::{
    EventEnvelope, EventToPersist, TRACEPARENT_METADATA_KEY, TRACESTATE_METADATA_KEY,
    TRACE_CONTEXT_METADATA_KEY,
};
use crate::query::StreamQuery;
use crate::tenant::Tenant;

/// Wraps a [`Backend`] so every `stream`/`append` call runs inside a named
/// `tracing` span.
///
/// Span creation failure (e.g. no subscriber installed) is silent: `tracing`
/// itself treats a disabled span as a no-op, so this wrapper never fails
/// where the inner backend wouldn't have.
#[derive(Debug, Clone)]
pub struct Instrumented<B> {
    inner: B,
}

impl<B> Instrumented<B> {
    /// Wraps `backend` with span instrumentation.
    pub fn new(backend: B) -> Self {
        Self { inner: backend }
    }
}

/// Extension trait mirroring the teacher's `EventStoreExt::with_tracing`.
pub trait BackendExt: Backend + Sized {
    /// Returns an instrumented version of this backend.
    fn with_tracing(self) -> Instrumented<Self> {
        Instrumented::new(self)
    }
}

impl<B: Backend> BackendExt for B {}

fn current_trace_context() -> Option<(String, String)> {
    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();

    if !span_context.is_valid() {
        return None;
    }

    let flags: u8 = if span_context.trace_flags().contains(TraceFlags::SAMPLED) {
        1
    } else {
        0
    };

    let traceparent = format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        flags
    );
    let tracestate = span_context.trace_state().header();

    Some((traceparent, tracestate))
}

fn stamp_trace_context(mut event: EventToPersist) -> EventToPersist {
    if let Some((traceparent, tracestate)) = current_trace_context() {
        event.metadata.insert(TRACEPARENT_METADATA_KEY.to_owned(), traceparent);
        event.metadata.insert(TRACESTATE_METADATA_KEY.to_owned(), tracestate);
    }
    event
}

/// Checks that `traceparent` has the W3C shape `{version}-{trace id}-{span
/// id}-{flags}`, each field the right length and all hex, per the `version
/// = 00` format this store itself writes in [`current_trace_context`].
/// Doesn't reject higher versions outright (future versions may add fields
/// after the first four, per the W3C spec), only malformed ones.
fn is_valid_traceparent(value: &str) -> bool {
    let mut fields = value.split('-');

    let is_hex = |field: &str, len: usize| field.len() == len && field.bytes().all(|b| b.is_ascii_hexdigit());

    let Some(version) = fields.next() else { return false };
    let Some(trace_id) = fields.next() else { return false };
    let Some(span_id) = fields.next() else { return false };
    let Some(flags) = fields.next() else { return false };

    is_hex(version, 2)
        && is_hex(trace_id, 32)
        && trace_id != "0".repeat(32)
        && is_hex(span_id, 16)
        && span_id != "0".repeat(16)
        && is_hex(flags, 2)
}

fn flag_trace_context(mut envelope: EventEnvelope) -> EventEnvelope {
    let has_valid_context = envelope
        .metadata
        .get(TRACEPARENT_METADATA_KEY)
        .is_some_and(|traceparent| is_valid_traceparent(traceparent));

    if has_valid_context {
        envelope
            .metadata
            .insert(TRACE_CONTEXT_METADATA_KEY.to_owned(), "available".to_owned());
    }
    envelope
}

#[async_trait]
impl<B: Backend> Backend for Instrumented<B> {
    type Scope = B::Scope;

    async fn stream(
        &self,
        tenant: &Tenant,
        query: &StreamQuery,
        max_count: Option<usize>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let span = tracing::info_span!(
            "Stream",
            query = %query,
            tenant = %tenant,
            events.max = max_count.unwrap_or(0),
        );

        let envelopes = self
            .inner
            .stream(tenant, query, max_count, cancellation)
            .instrument(span)
            .await?;
        Ok(envelopes.into_iter().map(flag_trace_context).collect())
    }

    async fn append(
        &self,
        tenant: &Tenant,
        events: Vec<EventToPersist>,
        boundary: Option<ConsistencyBoundary>,
        scope: Option<&Self::Scope>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let span = tracing::info_span!("Append", tenant = %tenant, events.count = events.len());

        async {
            for event in &events {
                let tags = event
                    .tags
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                tracing::trace!(event.id = %event.id, event.r#type = %event.event_type, event.tags = %tags, "appending event");
            }

            let events = events.into_iter().map(stamp_trace_context).collect();

            self.inner.append(tenant, events, boundary, scope, cancellation).await
        }
        .instrument(span)
        .await
    }
}
