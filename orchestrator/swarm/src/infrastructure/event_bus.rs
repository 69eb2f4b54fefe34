// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Runner Event Bus - Pub/Sub for runner diagnostics
//
// In-memory broadcast of RunnerEvents (audit outcomes, snapshot changes,
// boot time, time travel, subscription errors, teardown). Observers that fall
// behind lose the oldest events and are told how many they missed.

use crate::domain::events::RunnerEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RunnerEventBus {
    sender: broadcast::Sender<RunnerEvent>,
}

impl RunnerEventBus {
    /// Capacity determines how many events are buffered per slow receiver
    /// before the oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: RunnerEvent) {
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to runner diagnostics");
        }
    }

    pub fn subscribe(&self) -> RunnerEventReceiver {
        RunnerEventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct RunnerEventReceiver {
    receiver: broadcast::Receiver<RunnerEvent>,
}

impl RunnerEventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<RunnerEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Runner event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<RunnerEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Runner event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::RunnerId;
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = RunnerEventBus::new(8);
        let mut receiver = bus.subscribe();
        let runner_id = RunnerId::new();

        bus.publish(RunnerEvent::TimeTravel {
            runner_id,
            occurred_at: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.runner_id(), runner_id);
        assert_eq!(receiver.try_recv(), Err(EventBusError::Empty));
    }

    #[tokio::test]
    async fn test_lagged_receiver() {
        let bus = RunnerEventBus::new(2);
        let mut receiver = bus.subscribe();
        let runner_id = RunnerId::new();

        for _ in 0..5 {
            bus.publish(RunnerEvent::TimeTravel {
                runner_id,
                occurred_at: Utc::now(),
            });
        }

        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(_))));
        assert!(receiver.recv().await.is_ok());
    }

    #[test]
    fn test_diagnostic_json_is_tagged() {
        let event = RunnerEvent::SubscriptionError {
            runner_id: RunnerId::new(),
            error: "closed".into(),
            attempt: 1,
            retry_in_ms: 500,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "subscription_error");
        assert_eq!(json["retry_in_ms"], 500);
    }
}
