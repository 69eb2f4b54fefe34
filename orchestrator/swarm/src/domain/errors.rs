// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use swarm_machine_core::application::ReactionFailure;
use swarm_machine_core::domain::config::ConfigError;
use swarm_machine_core::domain::event::EventType;
use swarm_machine_core::domain::log::LogError;
use swarm_machine_core::domain::protocol::StateName;
use swarm_machine_core::domain::verifier::VerificationError;

/// Why a snapshot's commands are unavailable. Checked in this order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRejection {
    #[error("Runner is destroyed")]
    Destroyed,

    #[error("Runner has failed")]
    Failed,

    #[error("Runner has not caught up with the log yet")]
    NotCaughtUp,

    #[error("Runner is behind the log")]
    Behind,

    #[error("Runner still has {len} queued events")]
    QueueNotEmpty { len: usize },

    #[error("Snapshot version {snapshot} is expired (runner is at {current})")]
    Expired { snapshot: u64, current: u64 },

    #[error("Another command is in flight")]
    CommandInFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command rejected: {0}")]
    Rejected(#[from] CommandRejection),

    #[error("Command '{command}' is not available in state '{state}'")]
    UnknownCommand { state: StateName, command: String },

    #[error("Invalid command arguments: {0}")]
    Arguments(#[source] serde_json::Error),

    #[error("Command handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("Command '{command}' produced undeclared event type '{event_type}'")]
    UndeclaredEventType {
        command: String,
        event_type: EventType,
    },

    #[error("Failed to publish command events: {0}")]
    Publish(#[source] LogError),
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Runner failed: {0}")]
    Failed(ReactionFailure),

    #[error("Runner was destroyed")]
    Destroyed,

    #[error("Snapshot is in state '{actual}', not '{expected}'")]
    StateMismatch { expected: StateName, actual: StateName },

    #[error("Payload of state '{state}' does not match its type: {source}")]
    Payload {
        state: StateName,
        #[source]
        source: serde_json::Error,
    },

    #[error("State set does not match the protocol (missing: {missing:?}, unknown: {unknown:?})")]
    IncompleteStateSet {
        missing: Vec<StateName>,
        unknown: Vec<StateName>,
    },

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
