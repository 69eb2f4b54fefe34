// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Runner Diagnostics
//!
//! Events published on the runner's diagnostics bus. Purely observational:
//! nothing inside the runner consumes them.

use crate::domain::status::RunnerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swarm_machine_core::application::{DiscardReason, ReactionFailure};
use swarm_machine_core::domain::event::{EventId, EventType};
use swarm_machine_core::domain::protocol::StateName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// A new snapshot was emitted to iterators.
    Change {
        runner_id: RunnerId,
        state: StateName,
        version: u64,
        emitted_at: DateTime<Utc>,
    },
    AuditReaction {
        runner_id: RunnerId,
        event_id: EventId,
        event_type: EventType,
        from: StateName,
        to: StateName,
    },
    AuditDiscard {
        runner_id: RunnerId,
        event_id: EventId,
        event_type: EventType,
        state: StateName,
        reason: DiscardReason,
    },
    AuditFailure {
        runner_id: RunnerId,
        failure: ReactionFailure,
    },
    /// First catch-up since start.
    BootTime {
        runner_id: RunnerId,
        duration_ms: u64,
        events_applied: usize,
    },
    TimeTravel {
        runner_id: RunnerId,
        occurred_at: DateTime<Utc>,
    },
    SubscriptionError {
        runner_id: RunnerId,
        error: String,
        attempt: u32,
        retry_in_ms: u64,
    },
    Destroyed {
        runner_id: RunnerId,
        failed: bool,
        destroyed_at: DateTime<Utc>,
    },
}

impl RunnerEvent {
    pub fn runner_id(&self) -> RunnerId {
        match self {
            RunnerEvent::Change { runner_id, .. }
            | RunnerEvent::AuditReaction { runner_id, .. }
            | RunnerEvent::AuditDiscard { runner_id, .. }
            | RunnerEvent::AuditFailure { runner_id, .. }
            | RunnerEvent::BootTime { runner_id, .. }
            | RunnerEvent::TimeTravel { runner_id, .. }
            | RunnerEvent::SubscriptionError { runner_id, .. }
            | RunnerEvent::Destroyed { runner_id, .. } => *runner_id,
        }
    }
}
