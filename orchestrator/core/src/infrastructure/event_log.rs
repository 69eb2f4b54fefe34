// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Event Log - EventLog adapter backed by a Vec and a broadcast channel
//
// Every subscription first replays the matching history, then follows live
// appends through a tokio broadcast channel. History snapshot and channel
// subscription happen under one lock so no append is missed or duplicated.
//
// Besides plain storage the adapter can inject the log behaviours a runner
// must survive:
// - time_travel(): reorder history; subscribers get a TimeTravel notice
//   followed by a full redelivery
// - interrupt(): fail every open subscription
// - fail_next_publishes(): reject publications
// - hold_publishes(): park publications until the guard drops
//
// Events are lost on drop; there is no persistence.

use crate::domain::event::{EventId, LogEvent, Metadata, TaggedEvent};
use crate::domain::log::{EventLog, LogError, Query, SubscriptionMessage, SubscriptionStream};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info, warn};

const DEFAULT_SIGNAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum LogSignal {
    Appended(Vec<LogEvent>),
    /// Carries the reordered history so redelivery is consistent with the
    /// appends that follow the signal.
    TimeTravel(Vec<LogEvent>),
    Interrupted(String),
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<LogEvent>,
    lamport: u64,
    failing_publishes: usize,
}

struct Inner {
    state: Mutex<LogState>,
    signals: broadcast::Sender<LogSignal>,
    publish_gate: Arc<tokio::sync::Mutex<()>>,
    replay_chunk: Option<usize>,
}

/// Shared in-memory log; clones refer to the same log.
#[derive(Clone)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

/// Publications wait while this guard is alive.
pub struct PublishHold {
    _guard: OwnedMutexGuard<()>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_SIGNAL_CAPACITY, None)
    }

    /// Replay history in chunks of `chunk` events; only the last chunk is
    /// marked caught up.
    pub fn with_replay_chunk(chunk: usize) -> Self {
        Self::with_options(DEFAULT_SIGNAL_CAPACITY, Some(chunk.max(1)))
    }

    pub fn with_options(capacity: usize, replay_chunk: Option<usize>) -> Self {
        let (signals, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LogState::default()),
                signals,
                publish_gate: Arc::new(tokio::sync::Mutex::new(())),
                replay_chunk,
            }),
        }
    }

    /// Snapshot of the full history in log order.
    pub fn events(&self) -> Vec<LogEvent> {
        self.inner.state.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.signals.receiver_count()
    }

    /// Reorder history and notify every subscriber.
    pub fn time_travel(&self, reorder: impl FnOnce(&mut Vec<LogEvent>)) {
        let mut state = self.inner.state.lock();
        reorder(&mut state.events);
        info!(events = state.events.len(), "Event log reordered");
        let _ = self.inner.signals.send(LogSignal::TimeTravel(state.events.clone()));
    }

    /// Fail every open subscription with `reason`.
    pub fn interrupt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Interrupting event log subscriptions");
        let _state = self.inner.state.lock();
        let _ = self.inner.signals.send(LogSignal::Interrupted(reason));
    }

    /// Reject the next `count` publications.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.state.lock().failing_publishes = count;
    }

    /// Park publications until the returned guard is dropped.
    pub async fn hold_publishes(&self) -> PublishHold {
        PublishHold {
            _guard: self.inner.publish_gate.clone().lock_owned().await,
        }
    }

    fn replay(&self, history: &[LogEvent]) -> Vec<Result<SubscriptionMessage, LogError>> {
        let chunk = match self.inner.replay_chunk {
            Some(chunk) if history.len() > chunk => chunk,
            _ => {
                return vec![Ok(SubscriptionMessage::Events {
                    items: history.to_vec(),
                    caught_up: true,
                })]
            }
        };

        let chunks: Vec<&[LogEvent]> = history.chunks(chunk).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, items)| {
                Ok(SubscriptionMessage::Events {
                    items: items.to_vec(),
                    caught_up: index == last,
                })
            })
            .collect()
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

struct Follow {
    receiver: broadcast::Receiver<LogSignal>,
    query: Query,
    done: bool,
}

impl Follow {
    async fn next_batch(&mut self) -> Option<Vec<Result<SubscriptionMessage, LogError>>> {
        if self.done {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(LogSignal::Appended(events)) => {
                    let items: Vec<LogEvent> =
                        events.into_iter().filter(|e| self.query.matches(e)).collect();
                    if items.is_empty() {
                        continue;
                    }
                    return Some(vec![Ok(SubscriptionMessage::Events {
                        items,
                        caught_up: true,
                    })]);
                }
                Ok(LogSignal::TimeTravel(history)) => {
                    let items = history.into_iter().filter(|e| self.query.matches(e)).collect();
                    return Some(vec![
                        Ok(SubscriptionMessage::TimeTravel),
                        Ok(SubscriptionMessage::Events {
                            items,
                            caught_up: true,
                        }),
                    ]);
                }
                Ok(LogSignal::Interrupted(reason)) => {
                    self.done = true;
                    return Some(vec![Err(LogError::SubscriptionClosed(reason))]);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Log subscriber lagged by {} signals", n);
                    self.done = true;
                    return Some(vec![Err(LogError::Lagged(n))]);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn subscribe(&self, query: &Query) -> Result<SubscriptionStream, LogError> {
        let (history, receiver) = {
            let state = self.inner.state.lock();
            let history: Vec<LogEvent> =
                state.events.iter().filter(|e| query.matches(e)).cloned().collect();
            (history, self.inner.signals.subscribe())
        };
        debug!(tags = %query.tags, replay = history.len(), "New log subscription");

        let follow = Follow {
            receiver,
            query: query.clone(),
            done: false,
        };
        let live = stream::unfold(follow, |mut follow| async move {
            let batch = follow.next_batch().await?;
            Some((stream::iter(batch), follow))
        })
        .flatten();

        Ok(stream::iter(self.replay(&history)).chain(live).boxed())
    }

    async fn publish(&self, events: Vec<TaggedEvent>) -> Result<Vec<Metadata>, LogError> {
        let _gate = self.inner.publish_gate.lock().await;

        let mut state = self.inner.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            warn!(events = events.len(), "Rejecting publication");
            return Err(LogError::PublishRejected("injected publish failure".into()));
        }

        let mut appended = Vec::with_capacity(events.len());
        for tagged in events {
            state.lamport += 1;
            let meta = Metadata {
                event_id: EventId::new(format!("{:08}", state.lamport)),
                lamport: state.lamport,
                timestamp: Utc::now(),
                tags: tagged.tags,
            };
            appended.push(LogEvent {
                meta,
                event: tagged.event,
            });
        }
        state.events.extend(appended.iter().cloned());
        let metadata = appended.iter().map(|e| e.meta.clone()).collect();

        let receivers = self.inner.signals.send(LogSignal::Appended(appended)).unwrap_or(0);
        if receivers == 0 {
            debug!("No subscribers listening to event log");
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{Event, EventType, Tags};
    use std::time::Duration;

    fn tagged(event_type: &str) -> TaggedEvent {
        TaggedEvent {
            tags: Tags::new(["warehouse"]),
            event: Event::unit(event_type),
        }
    }

    fn query() -> Query {
        Query::new(Tags::new(["warehouse"]))
    }

    async fn next(stream: &mut SubscriptionStream) -> SubscriptionMessage {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("log error")
    }

    fn types(message: &SubscriptionMessage) -> Vec<String> {
        match message {
            SubscriptionMessage::Events { items, .. } => {
                items.iter().map(|e| e.event_type().to_string()).collect()
            }
            SubscriptionMessage::TimeTravel => vec![],
        }
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let log = InMemoryEventLog::new();
        log.publish(vec![tagged("a"), tagged("b")]).await.unwrap();

        let mut stream = log.subscribe(&query()).await.unwrap();
        let replay = next(&mut stream).await;
        assert_eq!(types(&replay), vec!["a", "b"]);
        assert!(matches!(replay, SubscriptionMessage::Events { caught_up: true, .. }));

        log.publish(vec![tagged("c")]).await.unwrap();
        assert_eq!(types(&next(&mut stream).await), vec!["c"]);
    }

    #[tokio::test]
    async fn test_empty_log_reports_caught_up() {
        let log = InMemoryEventLog::new();
        let mut stream = log.subscribe(&query()).await.unwrap();
        assert_eq!(
            next(&mut stream).await,
            SubscriptionMessage::Events {
                items: vec![],
                caught_up: true
            }
        );
    }

    #[tokio::test]
    async fn test_publish_assigns_ordered_metadata() {
        let log = InMemoryEventLog::new();
        let first = log.publish(vec![tagged("a"), tagged("b")]).await.unwrap();
        let second = log.publish(vec![tagged("c")]).await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(first[0].lamport < first[1].lamport);
        assert!(first[1].lamport < second[0].lamport);
        assert_ne!(first[0].event_id, first[1].event_id);
    }

    #[tokio::test]
    async fn test_query_filters_tags() {
        let log = InMemoryEventLog::new();
        log.publish(vec![TaggedEvent {
            tags: Tags::new(["factory"]),
            event: Event::unit("other"),
        }])
        .await
        .unwrap();
        log.publish(vec![tagged("mine")]).await.unwrap();

        let mut stream = log.subscribe(&query()).await.unwrap();
        assert_eq!(types(&next(&mut stream).await), vec!["mine"]);
    }

    #[tokio::test]
    async fn test_chunked_replay() {
        let log = InMemoryEventLog::with_replay_chunk(2);
        log.publish(vec![tagged("a"), tagged("b"), tagged("c")]).await.unwrap();

        let mut stream = log.subscribe(&query()).await.unwrap();
        assert!(matches!(
            next(&mut stream).await,
            SubscriptionMessage::Events { caught_up: false, .. }
        ));
        let last = next(&mut stream).await;
        assert_eq!(types(&last), vec!["c"]);
        assert!(matches!(last, SubscriptionMessage::Events { caught_up: true, .. }));
    }

    #[tokio::test]
    async fn test_time_travel_redelivers_history() {
        let log = InMemoryEventLog::new();
        log.publish(vec![tagged("a"), tagged("b")]).await.unwrap();
        let mut stream = log.subscribe(&query()).await.unwrap();
        next(&mut stream).await;

        log.time_travel(|events| events.reverse());

        assert_eq!(next(&mut stream).await, SubscriptionMessage::TimeTravel);
        assert_eq!(types(&next(&mut stream).await), vec!["b", "a"]);
        assert_eq!(log.events()[0].event_type(), &EventType::new("b"));
    }

    #[tokio::test]
    async fn test_interrupt_ends_subscription() {
        let log = InMemoryEventLog::new();
        let mut stream = log.subscribe(&query()).await.unwrap();
        next(&mut stream).await;

        log.interrupt("network partition");

        let item = stream.next().await.unwrap();
        assert_eq!(
            item,
            Err(LogError::SubscriptionClosed("network partition".into()))
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let log = InMemoryEventLog::new();
        log.fail_next_publishes(1);

        assert!(matches!(
            log.publish(vec![tagged("a")]).await,
            Err(LogError::PublishRejected(_))
        ));
        tokio_test::assert_ok!(log.publish(vec![tagged("a")]).await);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_held_publish_waits_for_release() {
        let log = InMemoryEventLog::new();
        let hold = log.hold_publishes().await;

        let publisher = {
            let log = log.clone();
            tokio::spawn(async move { log.publish(vec![tagged("a")]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.is_empty());

        drop(hold);
        let metadata = publisher.await.unwrap().unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(log.len(), 1);
    }
}
