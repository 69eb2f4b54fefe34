// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Log Port
//!
//! The shared, totally ordered event log every role of a swarm reads from and
//! appends to. Runners only see it through [`EventLog`]; the in-memory adapter
//! lives in `infrastructure::event_log`.
//!
//! A subscription yields [`SubscriptionMessage`]s:
//! - `Events { items, caught_up }` delivers the next ordered chunk. `caught_up`
//!   is true once the chunk reaches the log head.
//! - `TimeTravel` announces that the log reordered already delivered events.
//!   The subscriber must discard derived state; the log redelivers the full
//!   history on the same stream afterwards.

use crate::domain::event::{EventType, LogEvent, Metadata, Tags, TaggedEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Subscription filter: all `tags` must be present on an event, and its type
/// must be in `event_types` when that set is given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<BTreeSet<EventType>>,
}

impl Query {
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            event_types: None,
        }
    }

    pub fn with_event_types(mut self, event_types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = Some(event_types.into_iter().collect());
        self
    }

    pub fn matches(&self, event: &LogEvent) -> bool {
        if !self.tags.is_subset_of(&event.meta.tags) {
            return false;
        }
        match &self.event_types {
            Some(types) => types.contains(event.event_type()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    Events { items: Vec<LogEvent>, caught_up: bool },
    TimeTravel,
}

pub type SubscriptionStream = BoxStream<'static, Result<SubscriptionMessage, LogError>>;

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Open a subscription starting from the beginning of the log.
    async fn subscribe(&self, query: &Query) -> Result<SubscriptionStream, LogError>;

    /// Append events atomically. Returns the assigned metadata in input order.
    async fn publish(&self, events: Vec<TaggedEvent>) -> Result<Vec<Metadata>, LogError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Subscriber lagged by {0} log signals")]
    Lagged(u64),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),
}
