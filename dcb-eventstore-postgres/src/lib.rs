//! The PostgreSQL-backed [`dcb_eventstore::backend::Backend`] implementation.
//!
//! See [`store::PostgresBackend`] for the entry point: [`store::PostgresBackend::connect`]
//! opens a pool, creates the configured schema if missing, and runs
//! [`store::MIGRATIONS`].

#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod query;
pub mod scope;
pub mod store;

pub use config::PgConfig;
pub use scope::PgScope;
pub use store::{PostgresBackend, MIGRATIONS};
