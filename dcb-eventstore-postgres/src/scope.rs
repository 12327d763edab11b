//! Ambient transaction scope for the relational backend (`spec.md` §4.5),
//! built on [`dcb_eventstore::define_ambient_scope`].

use std::sync::Arc;

use sqlx::{Postgres, Transaction};
use tokio::sync::Mutex;

/// A shared handle to an open transaction, published as the ambient scope
/// while it is active. Cloning shares the same underlying transaction:
/// every clone locks the same [`Mutex`].
pub type PgScope = Arc<Mutex<Transaction<'static, Postgres>>>;

dcb_eventstore::define_ambient_scope!(ACTIVE_PG_TRANSACTION, PgScope);
