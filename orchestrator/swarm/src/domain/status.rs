// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runner Domain Types
//!
//! - [`RunnerId`]: unique identifier (UUID newtype).
//! - [`RunnerPhase`] / [`RunnerStatus`]: lifecycle of the runner itself, not
//!   of the protocol it runs.
//! - [`CommandLock`]: value object held while one command is in flight.
//! - [`RunnerEnd`]: terminal outcome seen by every iterator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use swarm_machine_core::application::ReactionFailure;
use swarm_machine_core::domain::event::EventId;
use uuid::Uuid;

/// Unique identifier for a runner instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerId(pub Uuid);

impl RunnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ```text
/// Starting -> Subscribed -> { CaughtUp <-> Behind } -> Destroyed
///        \________________________________________/-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    Starting,
    Subscribed,
    CaughtUp,
    Behind,
    Destroyed,
    Failed,
}

impl RunnerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerPhase::Destroyed | RunnerPhase::Failed)
    }
}

impl std::fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunnerPhase::Starting => "starting",
            RunnerPhase::Subscribed => "subscribed",
            RunnerPhase::CaughtUp => "caught_up",
            RunnerPhase::Behind => "behind",
            RunnerPhase::Destroyed => "destroyed",
            RunnerPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Published by the event loop after every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub phase: RunnerPhase,
    /// Bumped by every applied reaction and by a reset that moves the state.
    pub version: u64,
    pub queue_len: usize,
    pub caught_up_first_time: bool,
}

impl Default for RunnerStatus {
    fn default() -> Self {
        Self {
            phase: RunnerPhase::Starting,
            version: 0,
            queue_len: 0,
            caught_up_first_time: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Held from command start until its effect is observed or it fails.
///
/// Only the holder of `token` may release it through the failure path, so a
/// late failure of a superseded attempt cannot unlock a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLock {
    pub token: LockToken,
    /// State version of the snapshot the command was issued from.
    pub acquired_at_version: u64,
    pub acquired_at: DateTime<Utc>,
    /// Ids assigned by the log once publication succeeded.
    pub published: Option<BTreeSet<EventId>>,
    /// Ids observed by the runner while publication was still pending.
    pub echoed: BTreeSet<EventId>,
}

impl CommandLock {
    pub fn new(acquired_at_version: u64) -> Self {
        Self {
            token: LockToken::new(),
            acquired_at_version,
            acquired_at: Utc::now(),
            published: None,
            echoed: BTreeSet::new(),
        }
    }

    /// True once any published event has been seen by the runner.
    pub fn is_echoed(&self) -> bool {
        match &self.published {
            Some(published) => !published.is_disjoint(&self.echoed),
            None => false,
        }
    }
}

/// How a runner ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEnd {
    Destroyed,
    Failed(ReactionFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_echo_requires_publication() {
        let mut lock = CommandLock::new(3);
        lock.echoed.insert(EventId::new("a"));
        assert!(!lock.is_echoed());

        lock.published = Some(BTreeSet::from([EventId::new("b")]));
        assert!(!lock.is_echoed());

        lock.published = Some(BTreeSet::from([EventId::new("a"), EventId::new("b")]));
        assert!(lock.is_echoed());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RunnerPhase::Destroyed.is_terminal());
        assert!(RunnerPhase::Failed.is_terminal());
        assert!(!RunnerPhase::Behind.is_terminal());
        assert_eq!(RunnerPhase::CaughtUp.to_string(), "caught_up");
    }
}
