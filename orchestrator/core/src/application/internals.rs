// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runner Internals
//!
//! Mutable state core of one runner. Owned by the runner's single
//! event-processing task; everything else observes it through snapshots.
//!
//! Events are applied strictly one at a time in delivery order. Each
//! application has exactly one outcome:
//!
//! | Outcome | When | Effect on `current` |
//! |---------|------|---------------------|
//! | `React` | reaction exists, transform returns a payload | replaced |
//! | `Discard(NoReaction)` | no reaction for `(state, type)` | unchanged |
//! | `Discard(Skipped)` | transform returned the skip marker | unchanged |
//! | `Failure` | transform errored | unchanged, runner is terminal |
//!
//! Branch-join tracking sees every `React` and `Discard`, so a special event
//! without a local reaction still updates [`JoinBranch`].
//!
//! The state version moves on every applied reaction, self-loops included,
//! and on a reset that leaves the initial state. Snapshots compare against it
//! to detect expiry.

use crate::domain::branch::{self, BranchMetadata, JoinBranch};
use crate::domain::event::LogEvent;
use crate::domain::protocol::{ProtocolInternals, StateName};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A live `(state, payload)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateAndFactory {
    pub factory: StateName,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// No reaction registered for the event type in the current state.
    NoReaction,
    /// The reaction's transform returned the skip marker.
    Skipped,
}

#[derive(Debug, Clone)]
pub enum PushEventResult {
    React {
        event: LogEvent,
        from: StateName,
        to: StateName,
    },
    Discard {
        event: LogEvent,
        state: StateName,
        reason: DiscardReason,
    },
    Failure(ReactionFailure),
}

impl PushEventResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            PushEventResult::React { .. } => "react",
            PushEventResult::Discard { .. } => "discard",
            PushEventResult::Failure(_) => "failure",
        }
    }
}

/// Terminal error raised by a reaction transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error(
    "Reaction {from} --{}--> {to} failed on event {}: {error}",
    .event.event_type(),
    .event.event_id()
)]
pub struct ReactionFailure {
    pub from: StateName,
    pub to: StateName,
    pub event: LogEvent,
    pub error: String,
}

pub struct RunnerInternals {
    protocol: Arc<ProtocolInternals>,
    branches: BranchMetadata,
    initial: StateAndFactory,
    current: StateAndFactory,
    queue: VecDeque<LogEvent>,
    caught_up: bool,
    caught_up_first_time: bool,
    last_join_branch: Option<JoinBranch>,
    failure: Option<ReactionFailure>,
    version: u64,
}

impl RunnerInternals {
    pub fn new(protocol: Arc<ProtocolInternals>, branches: BranchMetadata) -> Self {
        let initial = StateAndFactory {
            factory: protocol.initial().clone(),
            payload: protocol.initial_payload().clone(),
        };
        Self {
            protocol,
            branches,
            current: initial.clone(),
            initial,
            queue: VecDeque::new(),
            caught_up: false,
            caught_up_first_time: false,
            last_join_branch: None,
            failure: None,
            version: 0,
        }
    }

    pub fn protocol(&self) -> &Arc<ProtocolInternals> {
        &self.protocol
    }

    pub fn branches(&self) -> &BranchMetadata {
        &self.branches
    }

    pub fn current(&self) -> &StateAndFactory {
        &self.current
    }

    pub fn initial(&self) -> &StateAndFactory {
        &self.initial
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    pub fn caught_up_first_time(&self) -> bool {
        self.caught_up_first_time
    }

    pub fn last_join_branch(&self) -> Option<&JoinBranch> {
        self.last_join_branch.as_ref()
    }

    pub fn failure(&self) -> Option<&ReactionFailure> {
        self.failure.as_ref()
    }

    pub fn enqueue(&mut self, events: impl IntoIterator<Item = LogEvent>) {
        self.queue.extend(events);
    }

    /// Record the adapter's catch-up flag. Returns true on the first
    /// catch-up ever.
    pub fn mark_caught_up(&mut self, caught_up: bool) -> bool {
        self.caught_up = caught_up;
        if caught_up && !self.caught_up_first_time {
            self.caught_up_first_time = true;
            return true;
        }
        false
    }

    /// Apply one event to `current`.
    pub fn push_event(&mut self, event: &LogEvent) -> PushEventResult {
        if let Some(failure) = &self.failure {
            return PushEventResult::Failure(failure.clone());
        }

        let Some(reaction) = self
            .protocol
            .reaction(&self.current.factory, event.event_type())
        else {
            branch::track(&mut self.last_join_branch, &self.branches, event);
            return PushEventResult::Discard {
                event: event.clone(),
                state: self.current.factory.clone(),
                reason: DiscardReason::NoReaction,
            };
        };

        let from = self.current.factory.clone();
        let to = reaction.target().clone();

        match reaction.apply(&self.current.payload, &event.event) {
            Err(error) => {
                let failure = ReactionFailure {
                    from,
                    to,
                    event: event.clone(),
                    error: format!("{error:#}"),
                };
                self.failure = Some(failure.clone());
                PushEventResult::Failure(failure)
            }
            Ok(None) => {
                branch::track(&mut self.last_join_branch, &self.branches, event);
                PushEventResult::Discard {
                    event: event.clone(),
                    state: from,
                    reason: DiscardReason::Skipped,
                }
            }
            Ok(Some(payload)) => {
                self.current = StateAndFactory {
                    factory: to.clone(),
                    payload,
                };
                self.version += 1;
                branch::track(&mut self.last_join_branch, &self.branches, event);
                PushEventResult::React {
                    event: event.clone(),
                    from,
                    to,
                }
            }
        }
    }

    /// Drain the queue one event at a time, stopping at the first failure.
    ///
    /// `observe` sees every outcome, including the failure.
    pub fn apply_queue(
        &mut self,
        mut observe: impl FnMut(&PushEventResult),
    ) -> Option<ReactionFailure> {
        while let Some(event) = self.queue.pop_front() {
            let result = self.push_event(&event);
            observe(&result);
            if let PushEventResult::Failure(failure) = result {
                return Some(failure);
            }
        }
        None
    }

    /// Return to the initial state after a reordering notice.
    ///
    /// Keeps `caught_up_first_time`, the failure and the version history.
    pub fn reset(&mut self) {
        if self.current != self.initial {
            self.current = self.initial.clone();
            self.version += 1;
        }
        self.queue.clear();
        self.last_join_branch = None;
        self.caught_up = false;
    }
}

impl std::fmt::Debug for RunnerInternals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerInternals")
            .field("protocol", &self.protocol.name())
            .field("current", &self.current)
            .field("queue", &self.queue.len())
            .field("caught_up", &self.caught_up)
            .field("caught_up_first_time", &self.caught_up_first_time)
            .field("last_join_branch", &self.last_join_branch)
            .field("failure", &self.failure)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::design::ProtocolDesign;
    use crate::domain::event::{Event, EventId, EventType, Metadata, Tags};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PartId {
        id: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Requested {
        id: String,
    }

    fn delivered(seq: u64, event: Event) -> LogEvent {
        LogEvent {
            meta: Metadata {
                event_id: EventId::new(format!("e{seq}")),
                lamport: seq,
                timestamp: Utc::now(),
                tags: Tags::new(["warehouse"]),
            },
            event,
        }
    }

    fn part(seq: u64, id: &str) -> LogEvent {
        delivered(seq, Event::new("partID", serde_json::json!({ "id": id })))
    }

    /// S0 --partID--> S1 --bid--> S2; S1 rejects bids from "broken".
    fn protocol() -> Arc<ProtocolInternals> {
        let mut design = ProtocolDesign::new("warehouse", Tags::new(["warehouse"]));
        let part_id = design.event::<PartId>("partID").unwrap();
        let bid = design.event::<String>("bid").unwrap();
        design.event::<()>("car").unwrap();
        design.event::<()>("accept").unwrap();

        let s0 = design.design_empty("S0").unwrap();
        let s1 = design.design_state::<Requested>("S1").unwrap();
        let s2 = design.design_state::<Requested>("S2").unwrap();

        design
            .react(&s0, [part_id.ty()], &s1, |_, e| {
                let part: PartId = e.payload_as()?;
                if part.id == "skip" {
                    return Ok(None);
                }
                Ok(Some(Requested { id: part.id }))
            })
            .unwrap();
        design
            .react(&s1, [bid.ty()], &s2, |current: &Requested, e| {
                let bidder: String = e.payload_as()?;
                if bidder == "broken" {
                    anyhow::bail!("bidder {bidder} is broken");
                }
                Ok(Some(current.clone()))
            })
            .unwrap();
        design.finish(&s0, ()).unwrap()
    }

    fn branches() -> BranchMetadata {
        let mut succeeding = BTreeMap::new();
        succeeding.insert(EventType::new("accept"), BTreeSet::from([EventType::new("bid")]));
        BranchMetadata::new([EventType::new("accept")], succeeding)
    }

    fn state(name: &str) -> StateName {
        StateName::new(name).unwrap()
    }

    #[test]
    fn test_react_and_discard() {
        let mut internals = RunnerInternals::new(protocol(), BranchMetadata::default());

        let result = internals.push_event(&part(1, "x"));
        assert!(matches!(
            &result,
            PushEventResult::React { from, to, .. } if from.as_str() == "S0" && to.as_str() == "S1"
        ));
        assert_eq!(internals.current().factory, state("S1"));
        assert_eq!(internals.current().payload, serde_json::json!({ "id": "x" }));

        let mut fresh = RunnerInternals::new(protocol(), BranchMetadata::default());
        let result = fresh.push_event(&delivered(2, Event::unit("car")));
        assert!(matches!(
            result,
            PushEventResult::Discard { reason: DiscardReason::NoReaction, .. }
        ));
        assert_eq!(fresh.current(), fresh.initial());
        assert_eq!(fresh.version(), 0);
    }

    #[test]
    fn test_skip_marker_discards() {
        let mut internals = RunnerInternals::new(protocol(), BranchMetadata::default());
        let result = internals.push_event(&part(1, "skip"));

        assert!(matches!(
            result,
            PushEventResult::Discard { reason: DiscardReason::Skipped, .. }
        ));
        assert_eq!(internals.current().factory, state("S0"));
    }

    #[test]
    fn test_failure_leaves_state_untouched() {
        let mut internals = RunnerInternals::new(protocol(), BranchMetadata::default());
        internals.push_event(&part(1, "x"));
        let before = internals.current().clone();
        let version = internals.version();

        let result = internals.push_event(&delivered(2, Event::new("bid", serde_json::json!("broken"))));

        let PushEventResult::Failure(failure) = result else {
            panic!("expected failure");
        };
        assert_eq!(failure.from, state("S1"));
        assert_eq!(failure.to, state("S2"));
        assert!(failure.error.contains("broken"));
        assert_eq!(internals.current(), &before);
        assert_eq!(internals.version(), version);
        assert_eq!(internals.failure(), Some(&failure));
    }

    #[test]
    fn test_apply_queue_stops_at_failure() {
        let mut internals = RunnerInternals::new(protocol(), BranchMetadata::default());
        internals.enqueue([
            part(1, "x"),
            delivered(2, Event::new("bid", serde_json::json!("broken"))),
            delivered(3, Event::new("bid", serde_json::json!("fine"))),
        ]);

        let mut outcomes = Vec::new();
        let failure = internals.apply_queue(|result| outcomes.push(result.outcome()));

        assert!(failure.is_some());
        assert_eq!(outcomes, vec!["react", "failure"]);
        assert_eq!(internals.current().factory, state("S1"));
    }

    #[test]
    fn test_discarded_special_event_updates_join_branch() {
        let mut internals = RunnerInternals::new(protocol(), branches());

        // No reaction for "accept" in S0
        let result = internals.push_event(&delivered(1, Event::unit("accept")));
        assert!(matches!(result, PushEventResult::Discard { .. }));
        assert_eq!(internals.current().factory, state("S0"));

        let marker = internals.last_join_branch().unwrap();
        assert_eq!(marker.event_type, EventType::new("accept"));
        assert_eq!(marker.event_id.as_str(), "e1");
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut internals = RunnerInternals::new(protocol(), branches());
        internals.enqueue([part(9, "queued")]);
        internals.push_event(&part(1, "x"));
        internals.push_event(&delivered(2, Event::unit("accept")));
        assert!(internals.mark_caught_up(true));

        internals.reset();
        let version = internals.version();
        internals.reset();

        assert_eq!(internals.current(), internals.initial());
        assert_eq!(internals.queue_len(), 0);
        assert!(internals.last_join_branch().is_none());
        assert!(!internals.is_caught_up());
        assert!(internals.caught_up_first_time());
        assert_eq!(internals.version(), version);
    }

    #[test]
    fn test_replay_after_time_travel_reproduces_state() {
        let events = [
            part(1, "x"),
            delivered(2, Event::unit("accept")),
            delivered(3, Event::new("bid", serde_json::json!("fine"))),
        ];

        let mut internals = RunnerInternals::new(protocol(), branches());
        internals.enqueue(events.clone());
        assert!(internals.apply_queue(|_| {}).is_none());
        let expected = internals.current().clone();

        internals.reset();
        assert_eq!(internals.current(), internals.initial());
        assert!(internals.last_join_branch().is_none());

        internals.enqueue(events);
        assert!(internals.apply_queue(|_| {}).is_none());
        assert_eq!(internals.current(), &expected);
        assert!(internals.last_join_branch().is_none());
    }

    #[test]
    fn test_self_loop_reaction_bumps_version() {
        let mut design = ProtocolDesign::new("clock", Tags::new(["clock"]));
        let tick = design.event::<()>("tick").unwrap();
        let idle = design.design_empty("Idle").unwrap();
        design
            .react(&idle, [tick.ty()], &idle, |_, _| Ok(Some(())))
            .unwrap();
        let protocol = design.finish(&idle, ()).unwrap();
        let mut internals = RunnerInternals::new(protocol, BranchMetadata::default());

        let result = internals.push_event(&delivered(1, Event::unit("tick")));
        assert!(matches!(result, PushEventResult::React { .. }));
        assert_eq!(internals.current(), internals.initial());
        assert_eq!(internals.version(), 1);

        internals.push_event(&delivered(2, Event::unit("tick")));
        assert_eq!(internals.version(), 2);

        // Back at the initial state already, so the reset keeps the version
        internals.reset();
        assert_eq!(internals.version(), 2);
    }

    #[test]
    fn test_version_moves_on_reaction_and_reset() {
        let mut internals = RunnerInternals::new(protocol(), BranchMetadata::default());
        assert_eq!(internals.version(), 0);

        internals.push_event(&part(1, "x"));
        assert_eq!(internals.version(), 1);

        internals.push_event(&delivered(2, Event::unit("car")));
        assert_eq!(internals.version(), 1);

        internals.reset();
        assert_eq!(internals.version(), 2);

        // Resetting an initial runner changes nothing
        internals.reset();
        assert_eq!(internals.version(), 2);
    }

    #[test]
    fn test_first_catch_up_reported_once() {
        let mut internals = RunnerInternals::new(protocol(), BranchMetadata::default());
        assert!(!internals.mark_caught_up(false));
        assert!(internals.mark_caught_up(true));
        assert!(!internals.mark_caught_up(true));
        internals.reset();
        assert!(!internals.mark_caught_up(true));
    }
}
