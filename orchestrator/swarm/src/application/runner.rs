// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Machine Runner
//!
//! Runs one role's protocol against an [`EventLog`]. A single spawned task
//! owns the [`RunnerInternals`]: it subscribes to the log, applies delivered
//! events, resets on time travel, resubscribes after subscription errors and
//! publishes snapshots. Callers only ever see snapshots.
//!
//! ```text
//!   EventLog ──subscribe──▶ event loop ──apply──▶ RunnerInternals
//!      ▲                        │
//!      │                        ├─ status  (watch)     ─▶ CommandGate
//!      │                        ├─ feed    (watch)     ─▶ RunnerIter / get()
//!      │                        └─ diagnostics (broadcast)
//!      └──────publish────── CommandGate ◀── TypedState::commands()
//! ```
//!
//! Teardown (`destroy()`, the last handle being dropped, or a reaction
//! failure) runs once: it cancels the loop, fires destroy hooks and resolves
//! every iterator.

use crate::application::commands::{CommandGate, Control};
use crate::application::iterator::RunnerIter;
use crate::application::snapshot::StateOpaque;
use crate::domain::errors::RunnerError;
use crate::domain::events::RunnerEvent;
use crate::domain::status::{RunnerEnd, RunnerId, RunnerPhase, RunnerStatus};
use crate::infrastructure::event_bus::{RunnerEventBus, RunnerEventReceiver};
use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use swarm_machine_core::application::{
    PushEventResult, ReactionFailure, RunnerInternals, StateAndFactory,
};
use swarm_machine_core::domain::branch::BranchMetadata;
use swarm_machine_core::domain::config::RunnerConfig;
use swarm_machine_core::domain::design::StateId;
use swarm_machine_core::domain::event::{EventType, LogEvent, Tags};
use swarm_machine_core::domain::log::{EventLog, LogError, Query, SubscriptionMessage};
use swarm_machine_core::domain::protocol::ProtocolInternals;
use swarm_machine_core::domain::verifier::{ProtocolVerifier, Subscriptions, SwarmProtocolGraph};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type DestroyHook = Box<dyn FnOnce() + Send>;

/// Latest-wins slot shared by all iterators.
#[derive(Clone, Default)]
pub(crate) struct Feed {
    pub(crate) seq: u64,
    pub(crate) latest: Option<StateOpaque>,
    pub(crate) end: Option<RunnerEnd>,
}

pub(crate) struct RunnerCore {
    pub(crate) id: RunnerId,
    pub(crate) gate: Arc<CommandGate>,
    pub(crate) feed: watch::Sender<Feed>,
    pub(crate) diagnostics: RunnerEventBus,
    initial: StateOpaque,
    hooks: Mutex<Vec<DestroyHook>>,
    torn_down: AtomicBool,
}

impl RunnerCore {
    fn teardown(&self, end: RunnerEnd) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = matches!(end, RunnerEnd::Failed(_));

        self.gate.update_status(|status| {
            status.phase = if failed {
                RunnerPhase::Failed
            } else {
                RunnerPhase::Destroyed
            };
        });
        self.gate.cancel_token().cancel();
        self.gate.clear_lock();
        self.feed.send_modify(|feed| feed.end = Some(end));

        let hooks = std::mem::take(&mut *self.hooks.lock());
        let hook_count = hooks.len();
        for hook in hooks {
            hook();
        }

        self.diagnostics.publish(RunnerEvent::Destroyed {
            runner_id: self.id,
            failed,
            destroyed_at: Utc::now(),
        });
        info!(runner_id = %self.id, failed, hooks = hook_count, "Machine runner torn down");
    }

    fn on_destroy(&self, hook: DestroyHook) {
        let mut hooks = self.hooks.lock();
        if self.torn_down.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(hook);
    }
}

struct RunnerHandle {
    core: Arc<RunnerCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.core.teardown(RunnerEnd::Destroyed);
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct MachineRunnerBuilder {
    log: Arc<dyn EventLog>,
    protocol: Arc<ProtocolInternals>,
    branches: BranchMetadata,
    config: RunnerConfig,
    tags: Tags,
}

impl MachineRunnerBuilder {
    pub fn branches(mut self, branches: BranchMetadata) -> Self {
        self.branches = branches;
        self
    }

    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Extra tags attached to every published event, on top of the
    /// protocol's swarm tags.
    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Check the design against the verifier's projection and adopt its
    /// branch metadata.
    pub fn verify(
        mut self,
        verifier: &dyn ProtocolVerifier,
        protocol: &SwarmProtocolGraph,
        subscriptions: &Subscriptions,
        role: &str,
    ) -> Result<Self, RunnerError> {
        self.branches = self
            .protocol
            .check_projection(verifier, protocol, subscriptions, role)?;
        Ok(self)
    }

    /// Spawn the event loop. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<MachineRunner, RunnerError> {
        self.config.validate()?;

        let id = RunnerId::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let publish_tags = self
            .tags
            .iter()
            .fold(self.protocol.tags().clone(), |tags, tag| tags.with(tag));
        let query = subscription_query(&self.protocol, &self.branches);

        let gate = Arc::new(CommandGate::new(
            id,
            self.protocol.clone(),
            self.log.clone(),
            publish_tags,
            control_tx,
        ));
        let internals = RunnerInternals::new(self.protocol.clone(), self.branches);
        let initial = StateOpaque::new(gate.clone(), internals.initial().clone(), 0, None);
        let (feed, _) = watch::channel(Feed::default());

        let core = Arc::new(RunnerCore {
            id,
            gate,
            feed,
            diagnostics: RunnerEventBus::new(self.config.diagnostics_capacity),
            initial,
            hooks: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        });

        info!(
            runner_id = %id,
            protocol = %self.protocol.name(),
            tags = %query.tags,
            "Starting machine runner"
        );

        let event_loop = EventLoop {
            core: core.clone(),
            log: self.log,
            query,
            config: self.config,
            internals,
            control: control_rx,
            last_emitted: None,
            started_at: Instant::now(),
            applied: 0,
        };
        let task = tokio::spawn(event_loop.run());

        Ok(MachineRunner {
            handle: Arc::new(RunnerHandle {
                core,
                task: Mutex::new(Some(task)),
            }),
        })
    }
}

/// Event types the runner must observe: everything its design mentions plus
/// every type involved in branch joins.
fn subscription_query(protocol: &ProtocolInternals, branches: &BranchMetadata) -> Query {
    let mut event_types: BTreeSet<EventType> = protocol.event_types().clone();
    event_types.extend(branches.special_event_types.iter().cloned());
    for succeeding in branches.succeeding_non_branching_joining.values() {
        event_types.extend(succeeding.iter().cloned());
    }
    Query::new(protocol.tags().clone()).with_event_types(event_types)
}

// ============================================================================
// Public Handle
// ============================================================================

/// Handle to a running machine. Clones share the runner; dropping the last
/// clone destroys it.
#[derive(Clone)]
pub struct MachineRunner {
    handle: Arc<RunnerHandle>,
}

impl MachineRunner {
    pub fn builder(
        log: Arc<dyn EventLog>,
        protocol: Arc<ProtocolInternals>,
    ) -> MachineRunnerBuilder {
        MachineRunnerBuilder {
            log,
            protocol,
            branches: BranchMetadata::default(),
            config: RunnerConfig::default(),
            tags: Tags::default(),
        }
    }

    pub(crate) fn core(&self) -> &Arc<RunnerCore> {
        &self.handle.core
    }

    pub fn id(&self) -> RunnerId {
        self.core().id
    }

    pub fn protocol(&self) -> &Arc<ProtocolInternals> {
        self.core().gate.protocol()
    }

    /// Latest snapshot, `None` before the first catch-up.
    pub fn get(&self) -> Option<StateOpaque> {
        self.core().feed.borrow().latest.clone()
    }

    /// Snapshot of the designed initial state.
    pub fn initial(&self) -> StateOpaque {
        self.core().initial.clone()
    }

    pub fn status(&self) -> RunnerStatus {
        self.core().gate.status()
    }

    pub fn phase(&self) -> RunnerPhase {
        self.status().phase
    }

    pub fn watch_status(&self) -> watch::Receiver<RunnerStatus> {
        self.core().gate.watch_status()
    }

    /// The reaction failure that terminated the runner, if any.
    pub fn failure(&self) -> Option<ReactionFailure> {
        match &self.core().feed.borrow().end {
            Some(RunnerEnd::Failed(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    /// True while a command's lock is held.
    pub fn command_in_flight(&self) -> bool {
        self.core().gate.is_locked()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core().torn_down.load(Ordering::SeqCst)
    }

    /// Idempotent. Fires destroy hooks once and resolves every iterator.
    pub fn destroy(&self) {
        self.core().teardown(RunnerEnd::Destroyed);
    }

    /// Register a hook fired once on teardown. Runs immediately if the
    /// runner is already torn down.
    pub fn on_destroy(&self, hook: impl FnOnce() + Send + 'static) {
        self.core().on_destroy(Box::new(hook));
    }

    pub fn diagnostics(&self) -> RunnerEventReceiver {
        self.core().diagnostics.subscribe()
    }

    /// Iterator that destroys the runner when dropped.
    pub fn iter(&self) -> RunnerIter {
        RunnerIter::new(self.clone(), self.core().gate.cancel_token().clone(), true)
    }

    /// Iterator with its own teardown scope; dropping or destroying it
    /// leaves the runner running.
    pub fn no_auto_destroy(&self) -> RunnerIter {
        RunnerIter::new(
            self.clone(),
            self.core().gate.cancel_token().child_token(),
            false,
        )
    }

    /// Wait for the first snapshot.
    pub async fn ready(&self) -> Result<StateOpaque, RunnerError> {
        let mut feed = self.core().feed.subscribe();
        loop {
            {
                let current = feed.borrow_and_update();
                match &current.end {
                    Some(RunnerEnd::Failed(failure)) => {
                        return Err(RunnerError::Failed(failure.clone()))
                    }
                    Some(RunnerEnd::Destroyed) => return Err(RunnerError::Destroyed),
                    None => {}
                }
                if let Some(snapshot) = &current.latest {
                    return Ok(snapshot.clone());
                }
            }
            if feed.changed().await.is_err() {
                return Err(RunnerError::Destroyed);
            }
        }
    }

    /// Wait for the event loop task to exit.
    pub async fn stopped(&self) {
        let task = self.handle.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(runner_id = %self.id(), error = %e, "Runner event loop panicked");
            }
        }
    }

    /// Confirm that `states` is exactly the protocol's state set.
    pub fn refine_state_type(
        &self,
        states: impl IntoIterator<Item = StateId>,
    ) -> Result<Self, RunnerError> {
        let protocol = self.protocol();
        let mut supplied = BTreeSet::new();
        let mut unknown = Vec::new();
        for state in states {
            if state.protocol == protocol.id() && protocol.state(&state.name).is_some() {
                supplied.insert(state.name);
            } else {
                unknown.push(state.name);
            }
        }
        let missing: Vec<_> = protocol
            .state_names()
            .difference(&supplied)
            .cloned()
            .collect();

        if missing.is_empty() && unknown.is_empty() {
            Ok(self.clone())
        } else {
            Err(RunnerError::IncompleteStateSet { missing, unknown })
        }
    }
}

impl std::fmt::Debug for MachineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRunner")
            .field("id", &self.id())
            .field("protocol", &self.protocol().name())
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

struct EventLoop {
    core: Arc<RunnerCore>,
    log: Arc<dyn EventLog>,
    query: Query,
    config: RunnerConfig,
    internals: RunnerInternals,
    control: mpsc::UnboundedReceiver<Control>,
    last_emitted: Option<(StateAndFactory, u64)>,
    started_at: Instant,
    applied: usize,
}

impl EventLoop {
    async fn run(mut self) {
        let cancel = self.core.gate.cancel_token().clone();
        let mut attempt: u32 = 0;

        'subscribe: loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break 'subscribe,
                result = self.log.subscribe(&self.query) => result,
            };
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(error) => {
                    if !self.recover(&cancel, error, &mut attempt).await {
                        break 'subscribe;
                    }
                    continue 'subscribe;
                }
            };
            self.set_phase(RunnerPhase::Subscribed);
            debug!(runner_id = %self.core.id, "Subscribed to event log");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'subscribe,
                    Some(control) = self.control.recv() => self.on_control(control),
                    message = stream.next() => match message {
                        Some(Ok(SubscriptionMessage::Events { items, caught_up })) => {
                            attempt = 0;
                            if self.on_events(items, caught_up).is_break() {
                                break 'subscribe;
                            }
                        }
                        Some(Ok(SubscriptionMessage::TimeTravel)) => self.on_time_travel(),
                        Some(Err(error)) => {
                            if !self.recover(&cancel, error, &mut attempt).await {
                                break 'subscribe;
                            }
                            continue 'subscribe;
                        }
                        None => {
                            let error = LogError::SubscriptionClosed("stream ended".into());
                            if !self.recover(&cancel, error, &mut attempt).await {
                                break 'subscribe;
                            }
                            continue 'subscribe;
                        }
                    },
                }
            }
        }

        debug!(runner_id = %self.core.id, "Runner event loop stopped");
    }

    fn on_events(&mut self, items: Vec<LogEvent>, caught_up: bool) -> ControlFlow<()> {
        let core = self.core.clone();
        self.internals.enqueue(items);
        let queued = self.internals.queue_len();
        core.gate.update_status(|status| status.queue_len = queued);

        let mut applied = 0;
        let failure = self.internals.apply_queue(|result| {
            applied += 1;
            counter!("swarm_runner_events_total", "outcome" => result.outcome()).increment(1);
            audit(&core, result);
        });
        self.applied += applied;

        if let Some(failure) = failure {
            error!(runner_id = %core.id, error = %failure, "Reaction failed, terminating runner");
            core.teardown(RunnerEnd::Failed(failure));
            return ControlFlow::Break(());
        }

        let version = self.internals.version();
        core.gate.release_if_superseded(version);

        let first_catch_up = self.internals.mark_caught_up(caught_up);
        let caught_up_first_time = self.internals.caught_up_first_time();
        core.gate.update_status(|status| {
            if !status.phase.is_terminal() {
                status.phase = if caught_up {
                    RunnerPhase::CaughtUp
                } else {
                    RunnerPhase::Behind
                };
            }
            status.version = version;
            status.queue_len = 0;
            status.caught_up_first_time = caught_up_first_time;
        });

        if first_catch_up {
            let duration_ms = self.started_at.elapsed().as_millis() as u64;
            info!(
                runner_id = %core.id,
                duration_ms,
                events = self.applied,
                state = %self.internals.current().factory,
                "Runner caught up with event log"
            );
            core.diagnostics.publish(RunnerEvent::BootTime {
                runner_id: core.id,
                duration_ms,
                events_applied: self.applied,
            });
        }
        if caught_up {
            self.emit(false);
        }
        ControlFlow::Continue(())
    }

    fn on_time_travel(&mut self) {
        counter!("swarm_runner_time_travel_total").increment(1);
        info!(runner_id = %self.core.id, "Event log reordered, resetting runner");
        self.reset();
        self.core.diagnostics.publish(RunnerEvent::TimeTravel {
            runner_id: self.core.id,
            occurred_at: Utc::now(),
        });
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Refresh => self.emit(true),
        }
    }

    /// Reset and wait out the backoff. Returns false if cancelled meanwhile.
    async fn recover(
        &mut self,
        cancel: &CancellationToken,
        error: LogError,
        attempt: &mut u32,
    ) -> bool {
        let delay = self.config.backoff_for(*attempt);
        counter!("swarm_runner_resubscribe_total").increment(1);
        warn!(
            runner_id = %self.core.id,
            error = %error,
            attempt = *attempt,
            retry_in_ms = delay.as_millis() as u64,
            "Log subscription failed, resetting runner"
        );
        self.reset();
        self.core.diagnostics.publish(RunnerEvent::SubscriptionError {
            runner_id: self.core.id,
            error: error.to_string(),
            attempt: *attempt,
            retry_in_ms: delay.as_millis() as u64,
        });
        *attempt = attempt.saturating_add(1);

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn reset(&mut self) {
        self.internals.reset();
        let version = self.internals.version();
        self.core.gate.release_if_superseded(version);
        self.core.gate.update_status(|status| {
            if !status.phase.is_terminal() {
                status.phase = RunnerPhase::Behind;
            }
            status.version = version;
            status.queue_len = 0;
        });
    }

    fn set_phase(&self, phase: RunnerPhase) {
        self.core.gate.update_status(|status| {
            if !status.phase.is_terminal() {
                status.phase = phase;
            }
        });
    }

    /// Publish the current state to iterators unless it was already
    /// published at this version.
    fn emit(&mut self, force: bool) {
        if !self.internals.is_caught_up() {
            return;
        }
        let current = self.internals.current().clone();
        let version = self.internals.version();
        let unchanged = self
            .last_emitted
            .as_ref()
            .is_some_and(|(state, emitted)| *emitted == version && *state == current);
        if unchanged && !force {
            return;
        }

        let snapshot = StateOpaque::new(
            self.core.gate.clone(),
            current.clone(),
            version,
            self.internals.last_join_branch().cloned(),
        );
        self.core.feed.send_modify(|feed| {
            if feed.end.is_none() {
                feed.seq += 1;
                feed.latest = Some(snapshot);
            }
        });
        debug!(runner_id = %self.core.id, state = %current.factory, version, "Emitted snapshot");
        self.core.diagnostics.publish(RunnerEvent::Change {
            runner_id: self.core.id,
            state: current.factory.clone(),
            version,
            emitted_at: Utc::now(),
        });
        self.last_emitted = Some((current, version));
    }
}

fn audit(core: &RunnerCore, result: &PushEventResult) {
    let event = match result {
        PushEventResult::React { event, from, to } => {
            core.gate.observe_event(event.event_id());
            RunnerEvent::AuditReaction {
                runner_id: core.id,
                event_id: event.event_id().clone(),
                event_type: event.event_type().clone(),
                from: from.clone(),
                to: to.clone(),
            }
        }
        PushEventResult::Discard {
            event,
            state,
            reason,
        } => {
            core.gate.observe_event(event.event_id());
            RunnerEvent::AuditDiscard {
                runner_id: core.id,
                event_id: event.event_id().clone(),
                event_type: event.event_type().clone(),
                state: state.clone(),
                reason: *reason,
            }
        }
        PushEventResult::Failure(failure) => RunnerEvent::AuditFailure {
            runner_id: core.id,
            failure: failure.clone(),
        },
    };
    core.diagnostics.publish(event);
}
