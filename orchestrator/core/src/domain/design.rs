// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # State/Transition Design Surface
//!
//! Builder used by an implementer to declare one role's machine:
//!
//! ```text
//! ProtocolDesign::new("warehouse", tags)
//!   ├─ event::<T>("partID")            register event types
//!   ├─ design_state::<P>("Auction")    register states (typed payload)
//!   ├─ command(&state, "request", ..)  user-invoked actions emitting events
//!   ├─ react(&from, [types], &to, ..)  event-driven transitions
//!   └─ finish(&initial, payload)       -> Arc<ProtocolInternals>
//! ```
//!
//! Every contract violation (duplicate names, unregistered event types,
//! two reactions for one `(state, event type)`) is rejected immediately by
//! the call that introduces it. Nothing is deferred to runtime.
//!
//! Payloads and command arguments are typed at the surface and stored as
//! JSON values inside the protocol, so one runner can hold every state of a
//! protocol behind a single `(state name, payload)` pair.

use crate::domain::branch::JoinBranch;
use crate::domain::event::{Event, EventDesign, EventType, Tags};
use crate::domain::protocol::{
    CommandDesign, CommandFn, ErasedCommandContext, ProtocolId, ProtocolInternals,
    ReactionDesign, ReactionFn, StateDesign, StateName, StateNameError,
};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Typed Handles
// ============================================================================

/// Typed handle to a designed state carrying payload `P`.
pub struct StateFactory<P> {
    protocol: ProtocolId,
    name: StateName,
    _payload: PhantomData<fn() -> P>,
}

impl<P> StateFactory<P> {
    pub fn name(&self) -> &StateName {
        &self.name
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// Untyped identity, e.g. for [`StateId`] sets.
    pub fn id(&self) -> StateId {
        StateId {
            protocol: self.protocol,
            name: self.name.clone(),
        }
    }
}

impl<P> Clone for StateFactory<P> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol,
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for StateFactory<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateFactory")
            .field("protocol", &self.protocol)
            .field("name", &self.name)
            .finish()
    }
}

/// Untyped identity of a state factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId {
    pub protocol: ProtocolId,
    pub name: StateName,
}

/// Typed handle to a command of a state with payload `P`, taking arguments `A`.
pub struct CommandRef<P, A> {
    protocol: ProtocolId,
    state: StateName,
    name: String,
    _marker: PhantomData<fn(P, A)>,
}

impl<P, A> CommandRef<P, A> {
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn state(&self) -> &StateName {
        &self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P, A> Clone for CommandRef<P, A> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol,
            state: self.state.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P, A> std::fmt::Debug for CommandRef<P, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRef")
            .field("state", &self.state)
            .field("name", &self.name)
            .finish()
    }
}

/// Context passed to a typed command handler.
#[derive(Debug)]
pub struct CommandContext<'a, P> {
    pub state: &'a StateName,
    pub payload: P,
    /// Unresolved branch-join marker at the time the command runs.
    pub last_join_branch: Option<&'a JoinBranch>,
}

// ============================================================================
// Builder
// ============================================================================

pub struct ProtocolDesign {
    id: ProtocolId,
    name: String,
    tags: Tags,
    event_types: BTreeSet<EventType>,
    states: BTreeMap<StateName, StateDesign>,
}

impl ProtocolDesign {
    pub fn new(name: impl Into<String>, tags: Tags) -> Self {
        Self {
            id: ProtocolId::new(),
            name: name.into(),
            tags,
            event_types: BTreeSet::new(),
            states: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ProtocolId {
        self.id
    }

    /// Register an event type and return its typed factory.
    pub fn event<T>(
        &mut self,
        event_type: impl Into<EventType>,
    ) -> Result<EventDesign<T>, DesignError> {
        let event_type = event_type.into();
        if !self.event_types.insert(event_type.clone()) {
            return Err(DesignError::DuplicateEventType(event_type));
        }
        Ok(EventDesign::new(event_type))
    }

    /// Register a state carrying a payload of type `P`.
    pub fn design_state<P>(&mut self, name: &str) -> Result<StateFactory<P>, DesignError> {
        let name = StateName::new(name)?;
        if self.states.contains_key(&name) {
            return Err(DesignError::DuplicateState(name));
        }
        self.states.insert(name.clone(), StateDesign::new(name.clone()));
        Ok(StateFactory {
            protocol: self.id,
            name,
            _payload: PhantomData,
        })
    }

    /// Register a state without payload.
    pub fn design_empty(&mut self, name: &str) -> Result<StateFactory<()>, DesignError> {
        self.design_state(name)
    }

    /// Attach a command to `state`.
    ///
    /// `produces` lists every event type the handler may return; the runner
    /// rejects any other type before publishing.
    pub fn command<P, A, F>(
        &mut self,
        state: &StateFactory<P>,
        name: &str,
        produces: impl IntoIterator<Item = EventType>,
        handler: F,
    ) -> Result<CommandRef<P, A>, DesignError>
    where
        P: DeserializeOwned + 'static,
        A: DeserializeOwned + 'static,
        F: for<'a> Fn(&CommandContext<'a, P>, A) -> anyhow::Result<Vec<Event>>
            + Send
            + Sync
            + 'static,
    {
        self.check_owned(state.protocol, &state.name)?;
        let event_types: Vec<EventType> = produces.into_iter().collect();
        for event_type in &event_types {
            if !self.event_types.contains(event_type) {
                return Err(DesignError::UnknownEventType {
                    usage: format!("command '{}' of state '{}'", name, state.name),
                    event_type: event_type.clone(),
                });
            }
        }

        let design = self
            .states
            .get_mut(&state.name)
            .ok_or_else(|| DesignError::StateNotFound(state.name.clone()))?;
        if design.commands.contains_key(name) {
            return Err(DesignError::DuplicateCommand {
                state: state.name.clone(),
                command: name.to_string(),
            });
        }

        let erased = erase_command(move |ctx, args| {
            let payload: P = serde_json::from_value(ctx.payload.clone())
                .with_context(|| format!("Invalid payload for state '{}'", ctx.state))?;
            let args: A =
                serde_json::from_value(args).context("Invalid command arguments")?;
            handler(
                &CommandContext {
                    state: ctx.state,
                    payload,
                    last_join_branch: ctx.last_join_branch,
                },
                args,
            )
        });

        design.commands.insert(
            name.to_string(),
            CommandDesign {
                name: name.to_string(),
                event_types,
                handler: erased,
            },
        );

        Ok(CommandRef {
            protocol: self.id,
            state: state.name.clone(),
            name: name.to_string(),
            _marker: PhantomData,
        })
    }

    /// Register one reaction per trigger type from `from` to `to`.
    ///
    /// The transform returns `Ok(None)` to skip the transition.
    pub fn react<P, N, F>(
        &mut self,
        from: &StateFactory<P>,
        triggers: impl IntoIterator<Item = EventType>,
        to: &StateFactory<N>,
        transform: F,
    ) -> Result<(), DesignError>
    where
        P: DeserializeOwned + 'static,
        N: Serialize + 'static,
        F: Fn(&P, &Event) -> anyhow::Result<Option<N>> + Send + Sync + 'static,
    {
        self.check_owned(from.protocol, &from.name)?;
        self.check_owned(to.protocol, &to.name)?;

        let triggers: Vec<EventType> = triggers.into_iter().collect();
        if triggers.is_empty() {
            return Err(DesignError::NoTriggers {
                from: from.name.clone(),
            });
        }

        let source = self
            .states
            .get(&from.name)
            .ok_or_else(|| DesignError::StateNotFound(from.name.clone()))?;
        let mut seen = BTreeSet::new();
        for event_type in &triggers {
            if !self.event_types.contains(event_type) {
                return Err(DesignError::UnknownEventType {
                    usage: format!("reaction {} -> {}", from.name, to.name),
                    event_type: event_type.clone(),
                });
            }
            if source.reactions.contains_key(event_type) || !seen.insert(event_type) {
                return Err(DesignError::DuplicateReaction {
                    state: from.name.clone(),
                    event_type: event_type.clone(),
                });
            }
        }

        let from_name = from.name.clone();
        let transform: ReactionFn = Arc::new(move |payload: &serde_json::Value, event: &Event| {
            let current: P = serde_json::from_value(payload.clone())
                .with_context(|| format!("Invalid payload for state '{}'", from_name))?;
            match transform(&current, event)? {
                Some(next) => Ok(Some(serde_json::to_value(next)?)),
                None => Ok(None),
            }
        });

        if let Some(source) = self.states.get_mut(&from.name) {
            for event_type in triggers {
                source.reactions.insert(
                    event_type,
                    ReactionDesign {
                        target: to.name.clone(),
                        transform: transform.clone(),
                    },
                );
            }
        }

        Ok(())
    }

    /// Freeze the design.
    pub fn finish<P: Serialize>(
        self,
        initial: &StateFactory<P>,
        initial_payload: P,
    ) -> Result<Arc<ProtocolInternals>, DesignError> {
        if initial.protocol != self.id || !self.states.contains_key(&initial.name) {
            return Err(DesignError::InitialStateNotRegistered(initial.name.clone()));
        }
        let initial_payload =
            serde_json::to_value(initial_payload).map_err(DesignError::InitialPayload)?;

        debug!(
            protocol = %self.name,
            states = self.states.len(),
            event_types = self.event_types.len(),
            initial = %initial.name,
            "Protocol design finished"
        );

        Ok(Arc::new(ProtocolInternals {
            id: self.id,
            name: self.name,
            tags: self.tags,
            event_types: self.event_types,
            states: self.states,
            initial: initial.name.clone(),
            initial_payload,
        }))
    }

    fn check_owned(&self, protocol: ProtocolId, name: &StateName) -> Result<(), DesignError> {
        if protocol != self.id {
            return Err(DesignError::ForeignState(name.clone()));
        }
        Ok(())
    }
}

fn erase_command<F>(handler: F) -> CommandFn
where
    F: for<'a> Fn(&ErasedCommandContext<'a>, serde_json::Value) -> anyhow::Result<Vec<Event>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(handler)
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DesignError {
    #[error(transparent)]
    InvalidStateName(#[from] StateNameError),

    #[error("State '{0}' is already designed in this protocol")]
    DuplicateState(StateName),

    #[error("Event type '{0}' is already registered")]
    DuplicateEventType(EventType),

    #[error("Event type '{event_type}' used by {usage} is not registered with the protocol")]
    UnknownEventType { usage: String, event_type: EventType },

    #[error("Command '{command}' is already defined for state '{state}'")]
    DuplicateCommand { state: StateName, command: String },

    #[error("State '{state}' already reacts to event type '{event_type}'")]
    DuplicateReaction { state: StateName, event_type: EventType },

    #[error("Reaction from state '{from}' lists no trigger event types")]
    NoTriggers { from: StateName },

    #[error("State '{0}' belongs to a different protocol design")]
    ForeignState(StateName),

    #[error("State '{0}' not found in protocol")]
    StateNotFound(StateName),

    #[error("Initial state '{0}' is not registered with this protocol")]
    InitialStateNotRegistered(StateName),

    #[error("Initial payload could not be serialized: {0}")]
    InitialPayload(#[source] serde_json::Error),
}
