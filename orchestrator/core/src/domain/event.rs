// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Value Objects
//!
//! Events are the only thing that flows between roles of a swarm: commands
//! synthesize them, the log orders and delivers them, and reactions match on
//! their type tag.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`EventType`] | String type tag reactions are keyed on |
//! | [`Event`] | Immutable `{ type, payload }` pair |
//! | [`EventDesign`] | Typed factory for one event type |
//! | [`Tags`] | Log tags scoping a swarm |
//! | [`Metadata`] / [`LogEvent`] | Log-assigned position of a delivered event |
//! | [`TaggedEvent`] | Publish input |

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::marker::PhantomData;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Type tag of an [`Event`] (e.g. `"partID"`, `"bid"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Log-assigned identifier of a persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Events
// ============================================================================

/// An immutable event: a type tag plus opaque payload data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<EventType>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Event without payload data.
    pub fn unit(event_type: impl Into<EventType>) -> Self {
        Self::new(event_type, serde_json::Value::Null)
    }

    /// Deserialize the payload, ignoring the type tag.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| EventError::Payload {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

/// Typed factory for one event type of a protocol.
///
/// Obtained from [`crate::domain::design::ProtocolDesign::event`], which
/// registers the type so commands and reactions may refer to it.
pub struct EventDesign<T> {
    event_type: EventType,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for EventDesign<T> {
    fn clone(&self) -> Self {
        Self {
            event_type: self.event_type.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for EventDesign<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDesign")
            .field("event_type", &self.event_type)
            .finish()
    }
}

impl<T> EventDesign<T> {
    pub(crate) fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            _payload: PhantomData,
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Owned copy of the type tag, convenient for command declarations.
    pub fn ty(&self) -> EventType {
        self.event_type.clone()
    }

    pub fn matches(&self, event: &Event) -> bool {
        event.event_type == self.event_type
    }
}

impl<T: Serialize + DeserializeOwned> EventDesign<T> {
    pub fn make(&self, payload: &T) -> Result<Event, EventError> {
        let payload = serde_json::to_value(payload).map_err(|source| EventError::Payload {
            event_type: self.event_type.clone(),
            source,
        })?;
        Ok(Event::new(self.event_type.clone(), payload))
    }

    /// Parse an event of this type; fails if the type tag differs.
    pub fn parse(&self, event: &Event) -> Result<T, EventError> {
        if !self.matches(event) {
            return Err(EventError::TypeMismatch {
                expected: self.event_type.clone(),
                actual: event.event_type.clone(),
            });
        }
        event.payload_as()
    }
}

// ============================================================================
// Log Positioning
// ============================================================================

/// Ordered set of log tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn with(mut self, tag: impl Into<String>) -> Self {
        self.0.insert(tag.into());
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// True if every tag of `self` is present in `other`.
    pub fn is_subset_of(&self, other: &Tags) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", joined.join(", "))
    }
}

/// Position and provenance the log assigns to a persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub event_id: EventId,
    pub lamport: u64,
    pub timestamp: DateTime<Utc>,
    pub tags: Tags,
}

/// An event as delivered by the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub meta: Metadata,
    pub event: Event,
}

impl LogEvent {
    pub fn event_type(&self) -> &EventType {
        &self.event.event_type
    }

    pub fn event_id(&self) -> &EventId {
        &self.meta.event_id
    }
}

/// An event queued for publication together with its tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedEvent {
    pub tags: Tags,
    pub event: Event,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Expected event of type '{expected}', got '{actual}'")]
    TypeMismatch {
        expected: EventType,
        actual: EventType,
    },

    #[error("Invalid payload for event type '{event_type}': {source}")]
    Payload {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
}
