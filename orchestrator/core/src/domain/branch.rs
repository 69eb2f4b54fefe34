// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Branch Metadata
//!
//! Per-role table computed once by the choreography verifier. It names the
//! event types that mark a concurrent branch choice ("special" events) and,
//! for each event type, the types that must still be observed before that
//! event's effect on branch selection is resolved.
//!
//! The runtime only consumes this table; how it is derived is the verifier's
//! concern.

use crate::domain::event::{EventId, EventType, LogEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMetadata {
    /// Event types that participate in branch joins.
    #[serde(default)]
    pub special_event_types: BTreeSet<EventType>,

    /// event type -> types that must follow before the choice is resolved.
    #[serde(default)]
    pub succeeding_non_branching_joining: BTreeMap<EventType, BTreeSet<EventType>>,
}

impl BranchMetadata {
    pub fn new(
        special_event_types: impl IntoIterator<Item = EventType>,
        succeeding_non_branching_joining: BTreeMap<EventType, BTreeSet<EventType>>,
    ) -> Self {
        Self {
            special_event_types: special_event_types.into_iter().collect(),
            succeeding_non_branching_joining,
        }
    }

    pub fn is_special(&self, event_type: &EventType) -> bool {
        self.special_event_types.contains(event_type)
    }

    pub fn succeeding(&self, event_type: &EventType) -> BTreeSet<EventType> {
        self.succeeding_non_branching_joining
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }
}

/// The most recent unresolved special event observed by a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinBranch {
    pub event_type: EventType,
    pub event_id: EventId,
    /// Types still to be observed before the branch is resolved.
    pub awaiting: BTreeSet<EventType>,
}

impl JoinBranch {
    pub fn is_awaiting(&self, event_type: &EventType) -> bool {
        self.awaiting.contains(event_type)
    }
}

/// Advances the join marker for one observed event.
///
/// Progress on the existing marker is applied first, so a special event that
/// also resolves the previous marker replaces it rather than being cleared.
pub(crate) fn track(
    marker: &mut Option<JoinBranch>,
    branches: &BranchMetadata,
    event: &LogEvent,
) {
    if let Some(current) = marker {
        current.awaiting.remove(event.event_type());
        if current.awaiting.is_empty() {
            *marker = None;
        }
    }

    if branches.is_special(event.event_type()) {
        *marker = Some(JoinBranch {
            event_type: event.event_type().clone(),
            event_id: event.event_id().clone(),
            awaiting: branches.succeeding(event.event_type()),
        });
    }
}
