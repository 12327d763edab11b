//! `dcb-eventstore` is a multi-tenant, append-only event log built around a
//! Dynamic Consistency Boundary (DCB): an optimistic-concurrency mechanism
//! that lets a writer predicate an append on the current state of an
//! arbitrary query, not on a single stream.
//!
//! This crate exposes the engine itself: the [`query::StreamQuery`] model,
//! the [`backend::Backend`] contract implemented by both the in-memory
//! reference backend ([`memory::InMemoryBackend`]) and, in the
//! `dcb-eventstore-postgres` crate, the durable relational backend.
//!
//! Dependency injection wiring, an outward HTTP/gRPC facade, and JSON
//! payload schemas are deliberately left to callers.

#![allow(missing_docs)]

pub mod backend;
pub mod error;
pub mod event;
pub mod memory;
pub mod query;
pub mod scope;
pub mod tenant;
#[cfg(feature = "tracing")]
pub mod tracing;

pub use backend::{Backend, ConsistencyBoundary};
pub use error::EventStoreError;
pub use event::{EventEnvelope, EventTag, EventToPersist, EventType, Metadata};
pub use memory::InMemoryBackend;
pub use query::StreamQuery;
pub use tenant::Tenant;
