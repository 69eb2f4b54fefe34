// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Protocol Internals
//!
//! The immutable result of designing one role's machine: every state, its
//! commands and its reactions, plus the registered event types. Built by
//! [`crate::domain::design::ProtocolDesign::finish`] and shared read-only
//! (behind `Arc`) by every runner of the protocol.
//!
//! # Invariants
//! - State names are unique within a protocol
//! - At most one reaction per `(state, event type)`
//! - Every command and reaction refers only to registered event types
//! - The initial state is one of the protocol's states
//!
//! The protocol converts into a [`TransitionGraph`], the artifact handed to
//! the choreography verifier.

use crate::domain::branch::JoinBranch;
use crate::domain::event::{Event, EventType, Tags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Identity of one protocol design.
///
/// Typed handles ([`crate::domain::design::StateFactory`],
/// [`crate::domain::design::CommandRef`]) carry it so they cannot be used
/// against another protocol's runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolId(pub Uuid);

impl ProtocolId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProtocolId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique name for a state within a protocol (e.g. "Initial", "Auction")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateName(String);

impl StateName {
    /// Create a new StateName with validation
    ///
    /// # Validation Rules
    /// - Must not be empty
    pub fn new(name: impl Into<String>) -> Result<Self, StateNameError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StateNameError);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("State name cannot be empty")]
pub struct StateNameError;

// ============================================================================
// Entities: Commands and Reactions
// ============================================================================

/// Erased reaction transform: `(current payload, event) -> next payload`,
/// `None` being the skip marker.
pub type ReactionFn = Arc<
    dyn Fn(&serde_json::Value, &Event) -> anyhow::Result<Option<serde_json::Value>> + Send + Sync,
>;

/// Erased command handler: `(context, args) -> events`.
pub type CommandFn = Arc<
    dyn for<'a> Fn(&ErasedCommandContext<'a>, serde_json::Value) -> anyhow::Result<Vec<Event>>
        + Send
        + Sync,
>;

/// What a command handler sees of the state it is invoked in.
#[derive(Debug, Clone, Copy)]
pub struct ErasedCommandContext<'a> {
    pub state: &'a StateName,
    pub payload: &'a serde_json::Value,
    pub last_join_branch: Option<&'a JoinBranch>,
}

/// Reaction registered for one `(source state, event type)` pair.
#[derive(Clone)]
pub struct ReactionDesign {
    pub(crate) target: StateName,
    pub(crate) transform: ReactionFn,
}

impl ReactionDesign {
    pub fn target(&self) -> &StateName {
        &self.target
    }

    pub fn apply(
        &self,
        payload: &serde_json::Value,
        event: &Event,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        (self.transform)(payload, event)
    }
}

impl std::fmt::Debug for ReactionDesign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactionDesign")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Command attached to a state.
#[derive(Clone)]
pub struct CommandDesign {
    pub(crate) name: String,
    pub(crate) event_types: Vec<EventType>,
    pub(crate) handler: CommandFn,
}

impl CommandDesign {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event types this command may emit.
    pub fn event_types(&self) -> &[EventType] {
        &self.event_types
    }

    pub fn declares(&self, event_type: &EventType) -> bool {
        self.event_types.contains(event_type)
    }

    pub fn invoke(
        &self,
        context: &ErasedCommandContext<'_>,
        args: serde_json::Value,
    ) -> anyhow::Result<Vec<Event>> {
        (self.handler)(context, args)
    }
}

impl std::fmt::Debug for CommandDesign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDesign")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

/// One designed state with its mechanism (commands) and outgoing reactions.
#[derive(Debug, Clone)]
pub struct StateDesign {
    pub(crate) name: StateName,
    pub(crate) commands: BTreeMap<String, CommandDesign>,
    pub(crate) reactions: BTreeMap<EventType, ReactionDesign>,
}

impl StateDesign {
    pub(crate) fn new(name: StateName) -> Self {
        Self {
            name,
            commands: BTreeMap::new(),
            reactions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &StateName {
        &self.name
    }

    pub fn command(&self, name: &str) -> Option<&CommandDesign> {
        self.commands.get(name)
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandDesign> {
        self.commands.values()
    }

    pub fn reaction(&self, event_type: &EventType) -> Option<&ReactionDesign> {
        self.reactions.get(event_type)
    }

    pub fn reactions(&self) -> impl Iterator<Item = (&EventType, &ReactionDesign)> {
        self.reactions.iter()
    }
}

// ============================================================================
// Aggregate Root: ProtocolInternals
// ============================================================================

#[derive(Debug)]
pub struct ProtocolInternals {
    pub(crate) id: ProtocolId,
    pub(crate) name: String,
    pub(crate) tags: Tags,
    pub(crate) event_types: BTreeSet<EventType>,
    pub(crate) states: BTreeMap<StateName, StateDesign>,
    pub(crate) initial: StateName,
    pub(crate) initial_payload: serde_json::Value,
}

impl ProtocolInternals {
    pub fn id(&self) -> ProtocolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Swarm tags scoping subscriptions and publications.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn event_types(&self) -> &BTreeSet<EventType> {
        &self.event_types
    }

    pub fn initial(&self) -> &StateName {
        &self.initial
    }

    pub fn initial_payload(&self) -> &serde_json::Value {
        &self.initial_payload
    }

    pub fn state(&self, name: &StateName) -> Option<&StateDesign> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &StateDesign> {
        self.states.values()
    }

    pub fn state_names(&self) -> BTreeSet<StateName> {
        self.states.keys().cloned().collect()
    }

    pub fn reaction(&self, state: &StateName, event_type: &EventType) -> Option<&ReactionDesign> {
        self.state(state).and_then(|s| s.reaction(event_type))
    }

    pub fn command(&self, state: &StateName, command: &str) -> Option<&CommandDesign> {
        self.state(state).and_then(|s| s.command(command))
    }

    /// Compile the design into the verifier's transition-graph artifact.
    ///
    /// Commands become `Execute` self-loops, reactions become `Input` edges.
    pub fn transition_graph(&self) -> TransitionGraph {
        let mut transitions = Vec::new();

        for state in self.states.values() {
            for command in state.commands.values() {
                transitions.push(GraphTransition {
                    source: state.name.clone(),
                    target: state.name.clone(),
                    label: TransitionLabel::Execute {
                        cmd: command.name.clone(),
                        event_types: command.event_types.clone(),
                    },
                });
            }
            for (event_type, reaction) in &state.reactions {
                transitions.push(GraphTransition {
                    source: state.name.clone(),
                    target: reaction.target.clone(),
                    label: TransitionLabel::Input {
                        event_type: event_type.clone(),
                    },
                });
            }
        }

        TransitionGraph {
            initial: self.initial.clone(),
            transitions,
        }
    }

    /// JSON form of [`Self::transition_graph`].
    pub fn to_analysis_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.transition_graph())
    }
}

// ============================================================================
// Value Objects: Transition Graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionGraph {
    pub initial: StateName,
    pub transitions: Vec<GraphTransition>,
}

impl TransitionGraph {
    pub fn transition_set(&self) -> BTreeSet<&GraphTransition> {
        self.transitions.iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphTransition {
    pub source: StateName,
    pub target: StateName,
    pub label: TransitionLabel,
}

impl std::fmt::Display for GraphTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.label {
            TransitionLabel::Execute { cmd, event_types } => {
                let types: Vec<&str> = event_types.iter().map(EventType::as_str).collect();
                write!(
                    f,
                    "{} --{}!({})--> {}",
                    self.source,
                    cmd,
                    types.join(", "),
                    self.target
                )
            }
            TransitionLabel::Input { event_type } => {
                write!(f, "{} --{}?--> {}", self.source, event_type, self.target)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum TransitionLabel {
    Execute {
        cmd: String,
        #[serde(rename = "eventTypes")]
        event_types: Vec<EventType>,
    },
    Input {
        #[serde(rename = "eventType")]
        event_type: EventType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_name_validation() {
        assert!(StateName::new("Initial").is_ok());
        assert!(StateName::new("").is_err());
        assert!(StateName::new("   ").is_err());
    }

    #[test]
    fn test_transition_label_json_shape() {
        let input = TransitionLabel::Input {
            event_type: EventType::new("partID"),
        };
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            serde_json::json!({ "tag": "Input", "eventType": "partID" })
        );

        let execute = TransitionLabel::Execute {
            cmd: "request".into(),
            event_types: vec![EventType::new("partID")],
        };
        assert_eq!(
            serde_json::to_value(&execute).unwrap(),
            serde_json::json!({ "tag": "Execute", "cmd": "request", "eventTypes": ["partID"] })
        );
    }

    #[test]
    fn test_graph_transition_display() {
        let transition = GraphTransition {
            source: StateName::new("S0").unwrap(),
            target: StateName::new("S1").unwrap(),
            label: TransitionLabel::Input {
                event_type: EventType::new("partID"),
            },
        };
        assert_eq!(transition.to_string(), "S0 --partID?--> S1");
    }
}
