// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Gate
//!
//! Decides whether a snapshot may issue a command and runs it. A command may
//! run only when every condition holds at call time:
//!
//! 1. the runner is neither destroyed nor failed
//! 2. the runner has caught up with the log at least once and is not behind
//! 3. no delivered events are waiting to be applied
//! 4. the snapshot's version is the runner's current version
//! 5. no other command holds the lock
//!
//! The lock is taken before the handler runs and survives a successful
//! publish. It is released when the runner observes one of the published
//! events, when the state version moves, when the handler emits nothing, or
//! when the handler or the publish fails (matched by token).

use crate::domain::errors::{CommandError, CommandRejection};
use crate::domain::status::{CommandLock, LockToken, RunnerId, RunnerPhase, RunnerStatus};
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use swarm_machine_core::domain::branch::JoinBranch;
use swarm_machine_core::domain::event::{EventId, Metadata, TaggedEvent, Tags};
use swarm_machine_core::domain::log::EventLog;
use swarm_machine_core::domain::protocol::{ErasedCommandContext, ProtocolInternals, StateName};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests from command callers to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Re-emit the current snapshot.
    Refresh,
}

/// What a command needs to know about the snapshot it was issued from.
pub(crate) struct CommandOrigin<'a> {
    pub state: &'a StateName,
    pub payload: &'a serde_json::Value,
    pub version: u64,
    pub last_join_branch: Option<&'a JoinBranch>,
}

pub(crate) struct CommandGate {
    runner_id: RunnerId,
    protocol: Arc<ProtocolInternals>,
    log: Arc<dyn EventLog>,
    publish_tags: Tags,
    status: watch::Sender<RunnerStatus>,
    lock: Mutex<Option<CommandLock>>,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
}

impl CommandGate {
    pub(crate) fn new(
        runner_id: RunnerId,
        protocol: Arc<ProtocolInternals>,
        log: Arc<dyn EventLog>,
        publish_tags: Tags,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        let (status, _) = watch::channel(RunnerStatus::default());
        Self {
            runner_id,
            protocol,
            log,
            publish_tags,
            status,
            lock: Mutex::new(None),
            cancel: CancellationToken::new(),
            control,
        }
    }

    pub(crate) fn protocol(&self) -> &Arc<ProtocolInternals> {
        &self.protocol
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn status(&self) -> RunnerStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<RunnerStatus> {
        self.status.subscribe()
    }

    pub(crate) fn update_status(&self, update: impl FnOnce(&mut RunnerStatus)) {
        self.status.send_modify(update);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock.lock().is_some()
    }

    /// Evaluate the gate for a snapshot taken at `version`.
    pub(crate) fn availability(&self, version: u64) -> Result<(), CommandRejection> {
        let lock = self.lock.lock();
        self.check(version, lock.is_some())
    }

    fn check(&self, version: u64, locked: bool) -> Result<(), CommandRejection> {
        let status = self.status.borrow();
        match status.phase {
            RunnerPhase::Destroyed => return Err(CommandRejection::Destroyed),
            RunnerPhase::Failed => return Err(CommandRejection::Failed),
            _ => {}
        }
        if self.cancel.is_cancelled() {
            return Err(CommandRejection::Destroyed);
        }
        if !status.caught_up_first_time {
            return Err(CommandRejection::NotCaughtUp);
        }
        if status.phase != RunnerPhase::CaughtUp {
            return Err(CommandRejection::Behind);
        }
        if status.queue_len > 0 {
            return Err(CommandRejection::QueueNotEmpty {
                len: status.queue_len,
            });
        }
        if status.version != version {
            return Err(CommandRejection::Expired {
                snapshot: version,
                current: status.version,
            });
        }
        if locked {
            return Err(CommandRejection::CommandInFlight);
        }
        Ok(())
    }

    fn acquire(&self, version: u64) -> Result<LockToken, CommandRejection> {
        let mut lock = self.lock.lock();
        self.check(version, lock.is_some())?;
        let acquired = CommandLock::new(version);
        let token = acquired.token;
        *lock = Some(acquired);
        Ok(token)
    }

    /// Release the lock if `token` still holds it.
    fn release(&self, token: LockToken) -> bool {
        let mut lock = self.lock.lock();
        match lock.as_ref() {
            Some(held) if held.token == token => {
                *lock = None;
                true
            }
            _ => false,
        }
    }

    fn mark_published(&self, token: LockToken, metadata: &[Metadata]) {
        let current_version = self.status.borrow().version;
        let mut lock = self.lock.lock();
        let Some(held) = lock.as_mut() else {
            return;
        };
        if held.token != token {
            return;
        }
        held.published = Some(metadata.iter().map(|m| m.event_id.clone()).collect());
        if held.is_echoed() || held.acquired_at_version != current_version {
            debug!(runner_id = %self.runner_id, "Command effect already observed, releasing lock");
            *lock = None;
        }
    }

    /// Called by the event loop for every applied event.
    pub(crate) fn observe_event(&self, event_id: &EventId) {
        let mut lock = self.lock.lock();
        let Some(held) = lock.as_mut() else {
            return;
        };
        match &held.published {
            Some(published) if published.contains(event_id) => {
                debug!(runner_id = %self.runner_id, event_id = %event_id, "Command echoed, releasing lock");
                *lock = None;
            }
            Some(_) => {}
            None => {
                held.echoed.insert(event_id.clone());
            }
        }
    }

    /// Called by the event loop after a batch; a moved version supersedes
    /// any command issued from an older snapshot.
    pub(crate) fn release_if_superseded(&self, version: u64) {
        let mut lock = self.lock.lock();
        if lock
            .as_ref()
            .is_some_and(|held| held.acquired_at_version != version)
        {
            *lock = None;
        }
    }

    pub(crate) fn clear_lock(&self) {
        *self.lock.lock() = None;
    }

    /// Run `command` from the snapshot described by `origin`.
    pub(crate) async fn execute(
        &self,
        origin: CommandOrigin<'_>,
        command: &str,
        args: serde_json::Value,
    ) -> Result<Vec<Metadata>, CommandError> {
        let design = self
            .protocol
            .command(origin.state, command)
            .ok_or_else(|| CommandError::UnknownCommand {
                state: origin.state.clone(),
                command: command.to_string(),
            })?;

        let token = match self.acquire(origin.version) {
            Ok(token) => token,
            Err(rejection) => {
                counter!("swarm_runner_commands_total", "result" => "rejected").increment(1);
                debug!(runner_id = %self.runner_id, command, reason = %rejection, "Command rejected");
                return Err(rejection.into());
            }
        };

        let context = ErasedCommandContext {
            state: origin.state,
            payload: origin.payload,
            last_join_branch: origin.last_join_branch,
        };
        let events = match design.invoke(&context, args) {
            Ok(events) => events,
            Err(error) => {
                self.release(token);
                counter!("swarm_runner_commands_total", "result" => "handler_error").increment(1);
                warn!(runner_id = %self.runner_id, command, error = %error, "Command handler failed");
                return Err(CommandError::Handler(error));
            }
        };

        if let Some(event) = events.iter().find(|e| !design.declares(&e.event_type)) {
            self.release(token);
            counter!("swarm_runner_commands_total", "result" => "undeclared").increment(1);
            return Err(CommandError::UndeclaredEventType {
                command: command.to_string(),
                event_type: event.event_type.clone(),
            });
        }

        if events.is_empty() {
            self.release(token);
            counter!("swarm_runner_commands_total", "result" => "empty").increment(1);
            debug!(runner_id = %self.runner_id, command, "Command produced no events");
            return Ok(Vec::new());
        }

        let tagged: Vec<TaggedEvent> = events
            .into_iter()
            .map(|event| TaggedEvent {
                tags: self.publish_tags.clone(),
                event,
            })
            .collect();
        let count = tagged.len();

        match self.log.publish(tagged).await {
            Ok(metadata) => {
                if !self.cancel.is_cancelled() {
                    self.mark_published(token, &metadata);
                }
                counter!("swarm_runner_commands_total", "result" => "published").increment(1);
                info!(runner_id = %self.runner_id, command, events = count, "Command published");
                Ok(metadata)
            }
            Err(error) => {
                counter!("swarm_runner_commands_total", "result" => "publish_failed").increment(1);
                warn!(runner_id = %self.runner_id, command, error = %error, "Command publish failed");
                if self.release(token) && !self.cancel.is_cancelled() {
                    let _ = self.control.send(Control::Refresh);
                }
                Err(CommandError::Publish(error))
            }
        }
    }
}
