// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Choreography Verifier Contract
//!
//! The global swarm protocol and its well-formedness checks live outside this
//! crate. A [`ProtocolVerifier`] projects the global protocol onto one role;
//! [`ProtocolInternals::check_projection`] then compares that projection with
//! the locally designed machine and hands back the [`BranchMetadata`] the
//! runner needs for join tracking.
//!
//! Only the shape of the exchange is fixed here:
//!
//! ```text
//! (SwarmProtocolGraph, Subscriptions, role) --project--> Projection { graph, branches }
//!                                                             |
//!                      local TransitionGraph  <--compare------+
//! ```

use crate::domain::branch::BranchMetadata;
use crate::domain::event::EventType;
use crate::domain::protocol::{GraphTransition, ProtocolInternals, TransitionGraph, TransitionLabel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Global protocol: initial state plus role-labelled transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmProtocolGraph {
    pub initial: String,
    pub transitions: Vec<SwarmTransition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmTransition {
    pub source: String,
    pub target: String,
    pub label: SwarmLabel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmLabel {
    pub cmd: String,
    pub role: String,
    #[serde(rename = "logType")]
    pub log_type: Vec<EventType>,
}

/// role -> event types the role subscribes to.
pub type Subscriptions = BTreeMap<String, BTreeSet<EventType>>;

/// Result of projecting the global protocol onto one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub graph: TransitionGraph,
    #[serde(default)]
    pub branches: BranchMetadata,
}

/// External projection algorithm.
pub trait ProtocolVerifier: Send + Sync {
    /// Errors are returned as human-readable diagnostics.
    fn project(
        &self,
        protocol: &SwarmProtocolGraph,
        subscriptions: &Subscriptions,
        role: &str,
    ) -> Result<Projection, Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Machine for role '{role}' does not match its projection: {}", .violations.join("; "))]
pub struct VerificationError {
    pub role: String,
    pub violations: Vec<String>,
}

impl ProtocolInternals {
    /// Check this design against the verifier's projection for `role`.
    ///
    /// The verifier is consulted exactly once. Transitions are compared as
    /// sets; the event-type list of a command is order-insensitive.
    pub fn check_projection(
        &self,
        verifier: &dyn ProtocolVerifier,
        protocol: &SwarmProtocolGraph,
        subscriptions: &Subscriptions,
        role: &str,
    ) -> Result<BranchMetadata, VerificationError> {
        let projection = verifier
            .project(protocol, subscriptions, role)
            .map_err(|violations| VerificationError {
                role: role.to_string(),
                violations,
            })?;

        let local = self.transition_graph();
        let mut violations = Vec::new();

        if projection.graph.initial != local.initial {
            violations.push(format!(
                "initial state is '{}' but the projection starts in '{}'",
                local.initial, projection.graph.initial
            ));
        }

        let expected = normalized(&projection.graph);
        let actual = normalized(&local);

        for missing in expected.difference(&actual) {
            violations.push(format!("missing transition {missing}"));
        }
        for extra in actual.difference(&expected) {
            violations.push(format!("unexpected transition {extra}"));
        }

        if violations.is_empty() {
            debug!(protocol = %self.name, role, "Machine matches projection");
            Ok(projection.branches)
        } else {
            warn!(
                protocol = %self.name,
                role,
                violations = violations.len(),
                "Machine does not match projection"
            );
            Err(VerificationError {
                role: role.to_string(),
                violations,
            })
        }
    }
}

fn normalized(graph: &TransitionGraph) -> BTreeSet<GraphTransition> {
    graph
        .transitions
        .iter()
        .cloned()
        .map(|mut transition| {
            if let TransitionLabel::Execute { event_types, .. } = &mut transition.label {
                event_types.sort();
                event_types.dedup();
            }
            transition
        })
        .collect()
}
