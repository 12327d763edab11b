//! `StreamQuery`: an immutable predicate over tags and event types.

use std::collections::HashSet;
use std::fmt;

use crate::event::{EventTag, EventType, StoredEvent};

/// An immutable predicate over a single event's tags and type.
///
/// Built fluently: every builder method (`with_tags`, `with_event_types`,
/// `requiring_all_tags`, `requiring_all_event_types`) returns a new,
/// independent `StreamQuery` rather than mutating in place.
///
/// An empty query (no tags, no types) matches nothing (see
/// [`StreamQuery::matches`]), and `Backend::stream` implementations treat it
/// the same way, so callers who want "all events" must supply at least one
/// predicate, e.g. `StreamQuery::new().with_event_types([EventType::wildcard()])`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamQuery {
    tags: HashSet<EventTag>,
    types: HashSet<EventType>,
    require_all_tags: bool,
    require_all_types: bool,
}

impl StreamQuery {
    /// Returns the empty query, matching nothing until tags or types are
    /// added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new query with `tags` appended to the existing tag set.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = EventTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Returns a new query with `types` appended to the existing type set.
    #[must_use]
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types.extend(types);
        self
    }

    /// Returns a new query requiring every tag in the set to be present
    /// (AND) rather than at least one (OR, the default).
    #[must_use]
    pub fn requiring_all_tags(mut self) -> Self {
        self.require_all_tags = true;
        self
    }

    /// Returns a new query requiring the event's type to equal the single
    /// type in the set (AND) rather than be a member of it (OR, the
    /// default). Only meaningful when exactly one type has been supplied;
    /// see [`StreamQuery::matches`] for the multi-type case.
    #[must_use]
    pub fn requiring_all_event_types(mut self) -> Self {
        self.require_all_types = true;
        self
    }

    /// Returns the query's tag set.
    #[must_use]
    pub fn tags(&self) -> &HashSet<EventTag> {
        &self.tags
    }

    /// Returns the query's type set.
    #[must_use]
    pub fn event_types(&self) -> &HashSet<EventType> {
        &self.types
    }

    /// Returns whether this query requires all tags to match.
    #[must_use]
    pub fn require_all_tags(&self) -> bool {
        self.require_all_tags
    }

    /// Returns whether this query requires an exact type match.
    #[must_use]
    pub fn require_all_event_types(&self) -> bool {
        self.require_all_types
    }

    /// Returns `true` if the query has neither tags nor types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.types.is_empty()
    }

    /// Evaluates this query against a single stored event.
    ///
    /// See `spec.md` §4.1 for the full truth table; in short: an empty
    /// query matches nothing, each non-empty dimension contributes its own
    /// predicate, and if both dimensions are non-empty both must hold.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if self.is_empty() {
            return false;
        }

        let tags_match = self.tags.is_empty() || self.matches_tags(&event.tags);
        let types_match = self.types.is_empty() || self.matches_type(&event.event_type);

        tags_match && types_match
    }

    fn matches_tags(&self, event_tags: &HashSet<EventTag>) -> bool {
        if self.require_all_tags {
            self.tags.iter().all(|tag| event_tags.contains(tag))
        } else {
            self.tags.iter().any(|tag| event_tags.contains(tag))
        }
    }

    fn matches_type(&self, event_type: &EventType) -> bool {
        if self.types.contains(&EventType::wildcard()) {
            return true;
        }

        if self.require_all_types {
            return self.types.len() == 1 && self.types.contains(event_type);
        }

        self.types.contains(event_type)
    }
}

impl fmt::Display for StreamQuery {
    /// Renders the canonical form used only for telemetry and logging:
    /// `*` for no conditions, `tag in ['t1','t2']` / `event type in ['e1']`
    /// for a single dimension, both joined with ` AND ` if either
    /// `require_all_*` flag is set, else ` OR `.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "*");
        }

        let tags_clause = (!self.tags.is_empty()).then(|| {
            let mut values: Vec<_> = self.tags.iter().map(EventTag::canonical).collect();
            values.sort();
            format!(
                "tag in [{}]",
                values
                    .iter()
                    .map(|v| format!("'{v}'"))
                    .collect::<Vec<_>>()
                    .join(",")
            )
        });

        let types_clause = (!self.types.is_empty()).then(|| {
            let mut values: Vec<_> = self.types.iter().map(EventType::as_str).collect();
            values.sort_unstable();
            format!(
                "event type in [{}]",
                values
                    .iter()
                    .map(|v| format!("'{v}'"))
                    .collect::<Vec<_>>()
                    .join(",")
            )
        });

        let joiner = if self.require_all_tags || self.require_all_types {
            " AND "
        } else {
            " OR "
        };

        let clauses: Vec<String> = [tags_clause, types_clause].into_iter().flatten().collect();
        write!(f, "{}", clauses.join(joiner))
    }
}
