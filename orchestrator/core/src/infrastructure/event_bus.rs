// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Experiment Events
//
// In-memory event streaming over tokio broadcast channels. The CLI renders
// progress from it; tests use it to check barrier ordering.

use crate::domain::events::ExperimentEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to experiment events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ExperimentEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: ExperimentEvent) {
        debug!("Publishing event: {:?}", event);

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            agent: None,
        }
    }

    /// Subscribe to events about a single agent
    pub fn subscribe_agent(&self, agent: impl Into<String>) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            agent: Some(agent.into()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ExperimentEvent>,
    agent: Option<String>,
}

impl EventReceiver {
    /// Receive the next matching event (blocks until one is available)
    pub async fn recv(&mut self) -> Result<ExperimentEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<ExperimentEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<ExperimentEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    fn matches(&self, event: &ExperimentEvent) -> bool {
        match &self.agent {
            Some(agent) => event.agent() == Some(agent.as_str()),
            None => true,
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
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
    use crate::domain::experiment::AgentRole;
    use crate::domain::signal::BarrierPhase;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(ExperimentEvent::AgentLaunched {
            agent: "exp-producer".to_string(),
            role: AgentRole::Producer,
            node: "worker-1".to_string(),
            launched_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            ExperimentEvent::AgentLaunched { agent, role, .. } => {
                assert_eq!(agent, "exp-producer");
                assert_eq!(role, AgentRole::Producer);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_filter() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_agent("exp-consumer");

        for agent in ["exp-producer", "exp-consumer"] {
            event_bus.publish(ExperimentEvent::SignalDelivered {
                agent: agent.to_string(),
                phase: BarrierPhase::Start,
                delivered_at: Utc::now(),
            });
        }

        let events = receiver.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent(), Some("exp-consumer"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        event_bus.publish(ExperimentEvent::ObservationWindowEnded { ended_at: Utc::now() });
    }
}
