// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Snapshot Iteration
//!
//! [`RunnerIter`] turns the runner's snapshot feed into a pull API. Each
//! iterator buffers at most one snapshot: a newer one replaces an unconsumed
//! older one, since only the latest state matters.
//!
//! Termination:
//! - runner destroyed, or this iterator's scope cancelled: `None`
//! - runner failed: one `Err(RunnerError::Failed)`, then `None`
//!
//! An iterator from [`MachineRunner::iter`] destroys the runner when it is
//! dropped or destroyed. One from [`MachineRunner::no_auto_destroy`] only
//! ends itself.

use crate::application::runner::{Feed, MachineRunner};
use crate::application::snapshot::StateOpaque;
use crate::domain::errors::RunnerError;
use crate::domain::status::RunnerEnd;
use futures::stream::{self, Stream};
use swarm_machine_core::application::ReactionFailure;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

enum Step {
    Value,
    Failed(ReactionFailure),
}

pub struct RunnerIter {
    runner: MachineRunner,
    feed: watch::Receiver<Feed>,
    buffered: Option<StateOpaque>,
    seen_seq: u64,
    scope: CancellationToken,
    auto_destroy: bool,
    finished: bool,
}

impl RunnerIter {
    pub(crate) fn new(runner: MachineRunner, scope: CancellationToken, auto_destroy: bool) -> Self {
        let mut feed = runner.core().feed.subscribe();
        let (seen_seq, buffered) = {
            let current = feed.borrow_and_update();
            (current.seq, current.latest.clone())
        };
        Self {
            runner,
            feed,
            buffered,
            seen_seq,
            scope,
            auto_destroy,
            finished: false,
        }
    }

    pub fn runner(&self) -> &MachineRunner {
        &self.runner
    }

    /// Independent iterator over the same runner with its own scope.
    pub fn no_auto_destroy(&self) -> RunnerIter {
        self.runner.no_auto_destroy()
    }

    /// Wait for the next snapshot without consuming it.
    pub async fn peek(&mut self) -> Option<Result<StateOpaque, RunnerError>> {
        match self.fill().await? {
            Step::Value => self.buffered.clone().map(Ok),
            Step::Failed(failure) => Some(Err(RunnerError::Failed(failure))),
        }
    }

    /// Wait for and consume the next snapshot.
    pub async fn next(&mut self) -> Option<Result<StateOpaque, RunnerError>> {
        match self.fill().await? {
            Step::Value => self.buffered.take().map(Ok),
            Step::Failed(failure) => {
                self.finished = true;
                self.buffered = None;
                Some(Err(RunnerError::Failed(failure)))
            }
        }
    }

    /// End this iterator; for an auto-destroy iterator this destroys the
    /// runner.
    pub fn destroy(&mut self) {
        self.finished = true;
        self.buffered = None;
        if self.auto_destroy {
            self.runner.destroy();
        } else {
            self.scope.cancel();
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<StateOpaque, RunnerError>> + Send {
        stream::unfold(self, |mut iter| async move {
            let item = iter.next().await?;
            Some((item, iter))
        })
    }

    async fn fill(&mut self) -> Option<Step> {
        loop {
            if self.finished {
                return None;
            }
            let end = self.feed.borrow().end.clone();
            match end {
                Some(RunnerEnd::Failed(failure)) => return Some(Step::Failed(failure)),
                Some(RunnerEnd::Destroyed) => {
                    self.finished = true;
                    self.buffered = None;
                    return None;
                }
                None => {}
            }
            if self.scope.is_cancelled() {
                self.finished = true;
                self.buffered = None;
                return None;
            }
            self.take_latest();
            if self.buffered.is_some() {
                return Some(Step::Value);
            }

            let changed = tokio::select! {
                changed = self.feed.changed() => Some(changed),
                _ = self.scope.cancelled() => None,
            };
            if let Some(Err(_)) = changed {
                self.finished = true;
                return None;
            }
        }
    }

    /// Replace the buffered snapshot with a newer one from the feed.
    fn take_latest(&mut self) {
        let feed = self.feed.borrow_and_update();
        if feed.seq != self.seen_seq {
            self.seen_seq = feed.seq;
            self.buffered = feed.latest.clone();
        }
    }
}

impl Drop for RunnerIter {
    fn drop(&mut self) {
        if self.auto_destroy {
            self.runner.destroy();
        }
    }
}
