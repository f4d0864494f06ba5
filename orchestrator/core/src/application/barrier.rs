// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Two-phase start/stop barrier.
//!
//! Start is fanned out to every agent at once; the observation window is
//! measured from the moment Start was issued, and Stop goes only to agents
//! whose Start write succeeded. A failed write is reported, never retried
//! or rolled back.

use crate::domain::errors::ExperimentError;
use crate::domain::events::ExperimentEvent;
use crate::domain::experiment::{Agent, AgentPhase};
use crate::domain::signal::{BarrierPhase, SignalStore, SignalTarget};
use crate::infrastructure::event_bus::EventBus;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
pub struct SignalRound {
    pub phase: BarrierPhase,
    /// Agents whose marker write succeeded
    pub delivered: Vec<String>,
    pub failures: Vec<ExperimentError>,
}

impl SignalRound {
    pub fn is_delivered(&self, agent: &str) -> bool {
        self.delivered.iter().any(|a| a == agent)
    }
}

#[derive(Debug)]
pub struct BarrierOutcome {
    pub start: SignalRound,
    pub stop: SignalRound,
    pub start_issued_at: Instant,
    pub stop_issued_at: Instant,
}

impl BarrierOutcome {
    pub fn window(&self) -> Duration {
        self.stop_issued_at.duration_since(self.start_issued_at)
    }

    pub fn into_failures(self) -> Vec<ExperimentError> {
        let mut failures = self.start.failures;
        failures.extend(self.stop.failures);
        failures
    }
}

pub struct BarrierCoordinator {
    store: Arc<dyn SignalStore>,
    event_bus: EventBus,
}

impl BarrierCoordinator {
    pub fn new(store: Arc<dyn SignalStore>, event_bus: EventBus) -> Self {
        Self { store, event_bus }
    }

    /// Write `phase` for every agent concurrently and wait for all writes.
    pub async fn signal(&self, agents: &[&Agent], phase: BarrierPhase) -> SignalRound {
        let writes = agents.iter().map(|agent| {
            let target = SignalTarget {
                node: agent.node.clone(),
                agent: agent.name.clone(),
                workload: agent.workload.clone(),
            };
            async move {
                let result = self.store.set(&target, phase).await;
                (target.agent, result)
            }
        });

        let mut round = SignalRound {
            phase,
            delivered: Vec::new(),
            failures: Vec::new(),
        };
        for (agent, result) in join_all(writes).await {
            match result {
                Ok(()) => {
                    metrics::counter!("netcap_barrier_signals_total", "phase" => phase.as_str(), "outcome" => "delivered")
                        .increment(1);
                    self.event_bus.publish(ExperimentEvent::SignalDelivered {
                        agent: agent.clone(),
                        phase,
                        delivered_at: Utc::now(),
                    });
                    round.delivered.push(agent);
                }
                Err(e) => {
                    metrics::counter!("netcap_barrier_signals_total", "phase" => phase.as_str(), "outcome" => "failed")
                        .increment(1);
                    warn!("{} signal to {} failed: {}", phase, agent, e);
                    self.event_bus.publish(ExperimentEvent::SignalFailed {
                        agent: agent.clone(),
                        phase,
                        reason: e.to_string(),
                        failed_at: Utc::now(),
                    });
                    round.failures.push(ExperimentError::SignalDelivery {
                        agent,
                        phase,
                        reason: e.to_string(),
                    });
                }
            }
        }
        round
    }

    /// Start, hold for `duration` from Start issue, then Stop.
    pub async fn run(&self, agents: &mut [Agent], duration: Duration) -> BarrierOutcome {
        let start_issued_at = Instant::now();
        info!("Issuing Start to {} agents", agents.len());
        let all: Vec<&Agent> = agents.iter().collect();
        let start = self.signal(&all, BarrierPhase::Start).await;
        self.event_bus.publish(ExperimentEvent::ObservationWindowStarted {
            duration,
            started_at: Utc::now(),
        });

        tokio::time::sleep_until(start_issued_at + duration).await;
        self.event_bus.publish(ExperimentEvent::ObservationWindowEnded {
            ended_at: Utc::now(),
        });

        let stop_issued_at = Instant::now();
        let started: Vec<&Agent> = agents
            .iter()
            .filter(|agent| start.is_delivered(&agent.name))
            .collect();
        info!("Issuing Stop to {} agents", started.len());
        let stop = self.signal(&started, BarrierPhase::Stop).await;

        for agent in agents.iter_mut() {
            if start.is_delivered(&agent.name) {
                agent.observe_phase(AgentPhase::Running);
            }
            if stop.is_delivered(&agent.name) {
                agent.observe_phase(AgentPhase::AwaitStop);
            }
        }

        BarrierOutcome {
            start,
            stop,
            start_issued_at,
            stop_issued_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::WorkloadRef;
    use crate::domain::experiment::AgentRole;
    use crate::domain::signal::{SignalError, SignalState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(String, BarrierPhase, Instant)>>,
        unreachable: BTreeSet<String>,
    }

    #[async_trait]
    impl SignalStore for RecordingStore {
        async fn set(&self, target: &SignalTarget, phase: BarrierPhase) -> Result<(), SignalError> {
            if self.unreachable.contains(&target.agent) {
                return Err(SignalError::WriteFailed {
                    agent: target.agent.clone(),
                    reason: "exec refused".to_string(),
                });
            }
            self.writes
                .lock()
                .push((target.agent.clone(), phase, Instant::now()));
            Ok(())
        }

        async fn get(&self, _target: &SignalTarget) -> Result<SignalState, SignalError> {
            Ok(SignalState::default())
        }

        async fn clear(&self, _target: &SignalTarget) -> Result<(), SignalError> {
            Ok(())
        }
    }

    fn agents() -> Vec<Agent> {
        [
            (AgentRole::Producer, "exp-producer", "worker-1"),
            (AgentRole::Consumer, "exp-consumer", "worker-2"),
            (AgentRole::Observer, "exp-observer-worker-1", "worker-1"),
        ]
        .into_iter()
        .map(|(role, name, node)| Agent::new(role, node, WorkloadRef::new("exp", name)))
        .collect()
    }

    #[tokio::test]
    async fn test_stop_follows_full_window() {
        let store = Arc::new(RecordingStore::default());
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let coordinator = BarrierCoordinator::new(store.clone(), bus);
        let mut agents = agents();
        let duration = Duration::from_millis(150);

        let outcome = coordinator.run(&mut agents, duration).await;
        assert!(outcome.window() >= duration);
        assert_eq!(outcome.start.delivered.len(), 3);
        assert_eq!(outcome.stop.delivered.len(), 3);
        assert!(outcome.into_failures().is_empty());
        assert!(agents.iter().all(|a| a.phase == AgentPhase::AwaitStop));

        let writes = store.writes.lock().clone();
        for agent in ["exp-producer", "exp-consumer", "exp-observer-worker-1"] {
            let start = writes
                .iter()
                .find(|(a, p, _)| a == agent && *p == BarrierPhase::Start)
                .unwrap();
            let stop = writes
                .iter()
                .find(|(a, p, _)| a == agent && *p == BarrierPhase::Stop)
                .unwrap();
            assert!(stop.2 >= start.2 + duration - Duration::from_millis(1));
        }

        // Every Start lands before the window closes, every Stop after.
        let order: Vec<&'static str> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ExperimentEvent::SignalDelivered { phase: BarrierPhase::Start, .. } => Some("start"),
                ExperimentEvent::SignalDelivered { phase: BarrierPhase::Stop, .. } => Some("stop"),
                ExperimentEvent::ObservationWindowEnded { .. } => Some("ended"),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["start", "start", "start", "ended", "stop", "stop", "stop"]);
    }

    #[tokio::test]
    async fn test_failed_start_gets_no_stop() {
        let store = Arc::new(RecordingStore {
            unreachable: BTreeSet::from(["exp-consumer".to_string()]),
            ..Default::default()
        });
        let coordinator = BarrierCoordinator::new(store.clone(), EventBus::default());
        let mut agents = agents();

        let outcome = coordinator.run(&mut agents, Duration::from_millis(20)).await;
        assert!(!outcome.start.is_delivered("exp-consumer"));
        assert!(!outcome.stop.is_delivered("exp-consumer"));
        assert_eq!(outcome.stop.delivered.len(), 2);

        let writes = store.writes.lock().clone();
        assert!(!writes.iter().any(|(a, _, _)| a == "exp-consumer"));

        let failures = outcome.into_failures();
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].is_fatal());
        assert!(matches!(
            &failures[0],
            ExperimentError::SignalDelivery { agent, phase: BarrierPhase::Start, .. } if agent == "exp-consumer"
        ));

        let consumer = agents.iter().find(|a| a.name == "exp-consumer").unwrap();
        assert_eq!(consumer.phase, AgentPhase::Init);
    }
}
