//! Value types carried by the event store: tags, types, and the envelopes
//! exchanged with callers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::EventStoreError;

static EVENT_TYPE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z-]+$").expect("event type pattern is valid"));

static TAG_COMPONENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("tag component pattern is valid"));

/// Metadata key the store injects into every returned [`EventEnvelope`],
/// carrying the assigned global position as a decimal string.
pub const POSITION_METADATA_KEY: &str = "_position";

/// Metadata key flagging, on `stream`, that a trace context was recorded
/// and parses successfully.
pub const TRACE_CONTEXT_METADATA_KEY: &str = "_trace_context";

/// Metadata key under which the W3C `traceparent` header is stored.
pub const TRACEPARENT_METADATA_KEY: &str = "traceparent";

/// Metadata key under which the W3C `tracestate` header is stored.
pub const TRACESTATE_METADATA_KEY: &str = "tracestate";

/// All metadata keys reserved by the core; callers must not set these on
/// [`EventToPersist::metadata`].
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    POSITION_METADATA_KEY,
    TRACE_CONTEXT_METADATA_KEY,
    TRACEPARENT_METADATA_KEY,
    TRACESTATE_METADATA_KEY,
];

/// A non-empty token matching `^[a-z-]+$`, naming the kind of an event.
///
/// The literal `"*"` is reserved as a wildcard when used inside a
/// [`crate::query::StreamQuery`] (see [`EventType::wildcard`]); it is not a
/// valid type for a stored event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(String);

impl EventType {
    /// Builds a new `EventType`, validating it against `^[a-z-]+$`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidEventType`] if `value` is empty or
    /// contains characters outside `[a-z-]`.
    pub fn new(value: impl Into<String>) -> Result<Self, EventStoreError> {
        let value = value.into();
        if value.is_empty() || !EVENT_TYPE_PATTERN.is_match(&value) {
            return Err(EventStoreError::InvalidEventType(value));
        }
        Ok(Self(value))
    }

    /// Returns the wildcard type `"*"`, matching any event type when used
    /// inside a [`crate::query::StreamQuery`].
    #[must_use]
    pub fn wildcard() -> Self {
        Self("*".to_owned())
    }

    /// Returns `true` if this is the wildcard type `"*"`.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == "*"
    }

    /// Returns the event type as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed label `concept:id` attached to an event, used as an index for
/// DCB queries.
///
/// Both `concept` and `id` must be non-empty and match
/// `^[A-Za-z0-9_-]+$`. Equality is structural on the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTag {
    concept: String,
    id: String,
}

impl EventTag {
    /// Builds a new `EventTag` from a `concept` and an `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidTag`] if either component is empty
    /// or contains characters outside `[A-Za-z0-9_-]`.
    pub fn new(concept: impl Into<String>, id: impl Into<String>) -> Result<Self, EventStoreError> {
        let concept = concept.into();
        let id = id.into();

        if !Self::is_valid_component(&concept) || !Self::is_valid_component(&id) {
            return Err(EventStoreError::InvalidTag(format!("{concept}:{id}")));
        }

        Ok(Self { concept, id })
    }

    /// Parses the canonical `concept:id` form, splitting on the first colon.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidTag`] if there is no colon, or if
    /// either side fails validation.
    pub fn parse(canonical: &str) -> Result<Self, EventStoreError> {
        let (concept, id) = canonical
            .split_once(':')
            .ok_or_else(|| EventStoreError::InvalidTag(canonical.to_owned()))?;
        Self::new(concept, id)
    }

    fn is_valid_component(value: &str) -> bool {
        !value.is_empty() && TAG_COMPONENT_PATTERN.is_match(value)
    }

    /// Returns the tag's concept.
    #[must_use]
    pub fn concept(&self) -> &str {
        &self.concept
    }

    /// Returns the tag's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the canonical `concept:id` string form.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.concept, self.id)
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.concept, self.id)
    }
}

/// Metadata carried alongside an event: arbitrary caller-supplied
/// `string -> string` pairs, plus a handful of keys the core reserves for
/// itself (see [`RESERVED_METADATA_KEYS`]).
pub type Metadata = HashMap<String, String>;

/// An event submitted to `append`, before a position has been assigned.
#[derive(Debug, Clone)]
pub struct EventToPersist {
    /// Caller-supplied unique identifier. Callers typically generate
    /// time-ordered UUIDs (e.g. UUIDv7) so that insertion order and id
    /// order coincide, though this is not required.
    pub id: Uuid,
    /// The kind of event.
    pub event_type: EventType,
    /// Tags used to index this event for DCB queries.
    pub tags: HashSet<EventTag>,
    /// Opaque payload bytes (typically JSON); the core never inspects it.
    pub payload: Vec<u8>,
    /// Caller-supplied metadata. Must not set any of
    /// [`RESERVED_METADATA_KEYS`].
    pub metadata: Metadata,
    /// The instant the caller considers this event to have occurred.
    pub created: SystemTime,
}

impl EventToPersist {
    /// Builds a new event with no tags and no metadata.
    #[must_use]
    pub fn new(id: Uuid, event_type: EventType, payload: Vec<u8>, created: SystemTime) -> Self {
        Self {
            id,
            event_type,
            tags: HashSet::new(),
            payload,
            metadata: Metadata::new(),
            created,
        }
    }

    /// Returns a copy of this event with `tags` added to its tag set.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = EventTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Returns a copy of this event with a metadata entry added.
    ///
    /// # Panics
    ///
    /// Panics if `key` is one of [`RESERVED_METADATA_KEYS`]: those keys are
    /// injected by the store itself and must never be set by callers.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        assert!(
            !RESERVED_METADATA_KEYS.contains(&key.as_str()),
            "metadata key '{key}' is reserved by the event store"
        );
        self.metadata.insert(key, value.into());
        self
    }
}

/// An event as observed by readers: the stored form, carrying the assigned
/// global [`position`][EventEnvelope::metadata] inside `metadata["_position"]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Identical to the input [`EventToPersist::id`].
    pub id: Uuid,
    /// Identical to the input [`EventToPersist::event_type`].
    pub event_type: EventType,
    /// Identical to the input [`EventToPersist::payload`].
    pub payload: Vec<u8>,
    /// The input metadata, plus `_position` (and, when tracing is active,
    /// trace-context keys).
    pub metadata: Metadata,
    /// Identical to the input [`EventToPersist::created`].
    pub created: SystemTime,
}

impl EventEnvelope {
    /// Returns the global position assigned to this event, parsed from
    /// `metadata["_position"]`.
    ///
    /// # Panics
    ///
    /// Panics if the envelope was not produced by a [`crate::backend::Backend`]
    /// implementation (i.e. the `_position` key is missing or malformed).
    #[must_use]
    pub fn position(&self) -> i64 {
        self.metadata
            .get(POSITION_METADATA_KEY)
            .and_then(|v| v.parse().ok())
            .expect("envelope produced by the event store always carries a valid _position")
    }
}

/// The internal, fully-assigned form of an event as kept by a backend.
///
/// Not part of the public contract; backends construct this on `append`
/// and translate it to an [`EventEnvelope`] on `stream`/`append` return.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// The global, strictly increasing position assigned at insert time.
    pub position: i64,
    /// See [`EventToPersist::id`].
    pub id: Uuid,
    /// The tenant this event belongs to.
    pub tenant: crate::tenant::Tenant,
    /// See [`EventToPersist::event_type`].
    pub event_type: EventType,
    /// See [`EventToPersist::tags`].
    pub tags: HashSet<EventTag>,
    /// See [`EventToPersist::payload`].
    pub payload: Vec<u8>,
    /// See [`EventToPersist::metadata`]. Does not yet carry `_position`.
    pub metadata: Metadata,
    /// See [`EventToPersist::created`].
    pub created: SystemTime,
}

impl StoredEvent {
    /// Converts this stored event into the [`EventEnvelope`] form returned
    /// to callers, injecting `_position`.
    #[must_use]
    pub fn into_envelope(self) -> EventEnvelope {
        let mut metadata = self.metadata;
        metadata.insert(POSITION_METADATA_KEY.to_owned(), self.position.to_string());

        EventEnvelope {
            id: self.id,
            event_type: self.event_type,
            payload: self.payload,
            metadata,
            created: self.created,
        }
    }
}
