// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # State Snapshots
//!
//! [`StateOpaque`] is an immutable copy of the runner's live state taken at
//! one instant. It never changes; it only *expires* once the runner's state
//! version moves past the version it was taken at.
//!
//! Narrowing a snapshot to a designed state yields a [`TypedState<P>`] with a
//! deserialized payload. Its [`TypedState::commands`] accessor is the only way
//! to issue commands and is present only while the command gate is open.

use crate::application::commands::{CommandGate, CommandOrigin};
use crate::domain::errors::{CommandError, CommandRejection, RunnerError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use swarm_machine_core::application::StateAndFactory;
use swarm_machine_core::domain::branch::JoinBranch;
use swarm_machine_core::domain::design::{CommandRef, StateFactory};
use swarm_machine_core::domain::event::Metadata;
use swarm_machine_core::domain::protocol::StateName;

#[derive(Clone)]
pub struct StateOpaque {
    gate: Arc<CommandGate>,
    state: StateAndFactory,
    version: u64,
    last_join_branch: Option<JoinBranch>,
    taken_at: DateTime<Utc>,
}

impl StateOpaque {
    pub(crate) fn new(
        gate: Arc<CommandGate>,
        state: StateAndFactory,
        version: u64,
        last_join_branch: Option<JoinBranch>,
    ) -> Self {
        Self {
            gate,
            state,
            version,
            last_join_branch,
            taken_at: Utc::now(),
        }
    }

    pub fn state_name(&self) -> &StateName {
        &self.state.factory
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.state.payload
    }

    pub fn state(&self) -> &StateAndFactory {
        &self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Unresolved branch-join marker at snapshot time.
    pub fn last_join_branch(&self) -> Option<&JoinBranch> {
        self.last_join_branch.as_ref()
    }

    /// True if the snapshot belongs to the state designed by `factory`.
    pub fn is<P>(&self, factory: &StateFactory<P>) -> bool {
        factory.protocol() == self.gate.protocol().id() && factory.name() == self.state_name()
    }

    pub fn cast<P: DeserializeOwned>(
        &self,
        factory: &StateFactory<P>,
    ) -> Result<TypedState<P>, RunnerError> {
        if !self.is(factory) {
            return Err(RunnerError::StateMismatch {
                expected: factory.name().clone(),
                actual: self.state_name().clone(),
            });
        }
        let payload = serde_json::from_value(self.state.payload.clone()).map_err(|source| {
            RunnerError::Payload {
                state: self.state_name().clone(),
                source,
            }
        })?;
        Ok(TypedState {
            snapshot: self.clone(),
            payload,
        })
    }

    /// [`Self::cast`], discarding the reason.
    pub fn as_state<P: DeserializeOwned>(&self, factory: &StateFactory<P>) -> Option<TypedState<P>> {
        self.cast(factory).ok()
    }

    pub fn is_expired(&self) -> bool {
        let status = self.gate.status();
        status.phase.is_terminal() || status.version != self.version
    }

    /// Which gate condition currently blocks this snapshot's commands.
    pub fn command_availability(&self) -> Result<(), CommandRejection> {
        self.gate.availability(self.version)
    }

    /// Names of the commands designed for this snapshot's state.
    pub fn command_names(&self) -> Vec<&str> {
        self.gate
            .protocol()
            .state(self.state_name())
            .map(|state| state.commands().map(|c| c.name()).collect())
            .unwrap_or_default()
    }

    /// True if this state offers every command in `required`.
    pub fn offers_commands(&self, required: &[&str]) -> bool {
        let available = self.command_names();
        required.iter().all(|name| available.contains(name))
    }
}

/// Snapshots compare by state name and payload.
impl PartialEq for StateOpaque {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl std::fmt::Debug for StateOpaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateOpaque")
            .field("state", &self.state.factory)
            .field("payload", &self.state.payload)
            .field("version", &self.version)
            .field("last_join_branch", &self.last_join_branch)
            .finish()
    }
}

impl std::fmt::Display for StateOpaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.state.factory, self.version)
    }
}

/// A snapshot narrowed to a state carrying payload `P`.
pub struct TypedState<P> {
    snapshot: StateOpaque,
    payload: P,
}

impl<P> TypedState<P> {
    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn snapshot(&self) -> &StateOpaque {
        &self.snapshot
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Present only while every gate condition holds.
    pub fn commands(&self) -> Option<StateCommands<'_, P>> {
        self.snapshot
            .command_availability()
            .ok()
            .map(|()| StateCommands { state: self })
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for TypedState<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedState")
            .field("state", self.snapshot.state_name())
            .field("payload", &self.payload)
            .field("version", &self.snapshot.version)
            .finish()
    }
}

/// Command accessor of a [`TypedState`]. The gate is evaluated again when a
/// command runs.
pub struct StateCommands<'a, P> {
    state: &'a TypedState<P>,
}

impl<P> StateCommands<'_, P> {
    pub async fn execute<A: Serialize>(
        &self,
        command: &CommandRef<P, A>,
        args: A,
    ) -> Result<Vec<Metadata>, CommandError> {
        let snapshot = &self.state.snapshot;
        if command.protocol() != snapshot.gate.protocol().id()
            || command.state() != snapshot.state_name()
        {
            return Err(CommandError::UnknownCommand {
                state: snapshot.state_name().clone(),
                command: command.name().to_string(),
            });
        }
        let args = serde_json::to_value(args).map_err(CommandError::Arguments)?;

        snapshot
            .gate
            .execute(
                CommandOrigin {
                    state: snapshot.state_name(),
                    payload: snapshot.payload(),
                    version: snapshot.version,
                    last_join_branch: snapshot.last_join_branch(),
                },
                command.name(),
                args,
            )
            .await
    }

    pub fn names(&self) -> Vec<&str> {
        self.state.snapshot.command_names()
    }
}
