//! Typed configuration for the relational backend (`spec.md` §6).

/// Default schema the backend's migrations and queries target.
pub const DEFAULT_SCHEMA: &str = "app";

/// Default bulk-insert threshold (see [`PgConfig::bulk_insert_threshold`]).
pub const DEFAULT_BULK_INSERT_THRESHOLD: usize = 5;

/// Configuration for [`crate::store::PostgresBackend`].
///
/// Grounded in the shape of `examples/orders-http-api-postgres-store`'s
/// `envconfig`-based config struct, minus the `envconfig` dependency itself:
/// nothing in this crate reads environment variables directly, that is the
/// outward facade's job (`spec.md` §1 lists it as an external collaborator).
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// A `postgres://` connection string, passed through to
    /// [`sqlx::postgres::PgPoolOptions`].
    pub connection_string: String,
    /// The schema migrations and queries target. Defaults to `"app"`.
    pub schema: String,
    /// Batches at or above this size use the bulk `VALUES` insert path;
    /// smaller batches insert one row at a time. Must be at least 1; a
    /// value of `0` is read as "unset" and falls back to the default.
    pub bulk_insert_threshold: usize,
}

impl PgConfig {
    /// Builds a config from a connection string, with `schema` and
    /// `bulk_insert_threshold` set to their defaults.
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: DEFAULT_SCHEMA.to_owned(),
            bulk_insert_threshold: DEFAULT_BULK_INSERT_THRESHOLD,
        }
    }

    /// Returns a copy of this config with `schema` overridden.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Returns a copy of this config with `bulk_insert_threshold`
    /// overridden. A value of `0` falls back to
    /// [`DEFAULT_BULK_INSERT_THRESHOLD`].
    #[must_use]
    pub fn with_bulk_insert_threshold(mut self, threshold: usize) -> Self {
        self.bulk_insert_threshold = if threshold == 0 {
            DEFAULT_BULK_INSERT_THRESHOLD
        } else {
            threshold
        };
        self
    }
}
