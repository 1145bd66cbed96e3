use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::circuit::CircuitBreakerBank;
use crate::detection::IssueCooldown;
use crate::error::{Result, SupervisorError};
use crate::intervention::{Delivery, RemediationState};
use crate::lifecycle::{HealthStateMachine, HealthTracker, LifecycleEvent};
use crate::storage::{AuditLog, AuditRecord};
use crate::types::{Agent, AgentId, AgentStatus, HealthSnapshot};

pub enum IngressMessage {
    Snapshot(HealthSnapshot),
    /// Completes once every message queued ahead of it has been processed.
    Flush(oneshot::Sender<()>),
}

pub enum DispatchMessage {
    /// `generation` is the agent's preempt generation when it was queued.
    Deliver { delivery: Delivery, generation: u64 },
    Flush(oneshot::Sender<()>),
}

/// Mutable per-agent supervision state. Only touched under the agent's
/// monitor lock, so agents never contend with each other.
#[derive(Debug)]
pub struct AgentMonitor {
    pub status: AgentStatus,
    pub tracker: HealthTracker,
    pub remediation: RemediationState,
    pub cooldown: IssueCooldown,
    published: watch::Sender<AgentStatus>,
}

impl AgentMonitor {
    pub fn new(history_capacity: usize) -> Self {
        let (published, _) = watch::channel(AgentStatus::Healthy);
        Self {
            status: AgentStatus::Healthy,
            tracker: HealthTracker::new(history_capacity),
            remediation: RemediationState::default(),
            cooldown: IssueCooldown::default(),
            published,
        }
    }

    /// Lock-free view of the status for readers outside the monitor lock.
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.published.subscribe()
    }

    /// Apply a lifecycle event. Returns the new status when it changed.
    pub async fn apply(
        &mut self,
        agent_id: &str,
        event: LifecycleEvent,
        now: DateTime<Utc>,
        audit: &AuditLog,
    ) -> Option<AgentStatus> {
        let next = match HealthStateMachine::transition(self.status, event) {
            Ok(next) => next,
            Err(e) => {
                log::debug!("Ignoring event for {}: {}", agent_id, e);
                return None;
            }
        };
        if next == self.status {
            return None;
        }

        let from = self.status;
        self.status = next;
        self.published.send_replace(next);
        if next == AgentStatus::Healthy {
            log::info!("Agent {} {} -> {} ({})", agent_id, from, next, event.as_str());
        } else {
            log::warn!("Agent {} {} -> {} ({})", agent_id, from, next, event.as_str());
        }

        audit
            .record(
                now,
                AuditRecord::Transition {
                    agent_id: agent_id.to_string(),
                    from,
                    to: next,
                    event,
                },
            )
            .await;
        Some(next)
    }
}

pub struct AgentEntry {
    agent: RwLock<Agent>,
    pub monitor: tokio::sync::Mutex<AgentMonitor>,
    status: watch::Receiver<AgentStatus>,
    ingress: mpsc::Sender<IngressMessage>,
    /// Remediation commands, delivered in order outside the monitor lock.
    dispatch: mpsc::UnboundedSender<DispatchMessage>,
    /// Bumped by operator overrides; cancels deliveries queued before it.
    preempt: watch::Sender<u64>,
    /// Held across the enqueue so accepted snapshots keep timestamp order.
    last_accepted: tokio::sync::Mutex<Option<DateTime<Utc>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentEntry {
    fn new(
        agent: Agent,
        ingress: mpsc::Sender<IngressMessage>,
        dispatch: mpsc::UnboundedSender<DispatchMessage>,
        history_capacity: usize,
    ) -> Self {
        let monitor = AgentMonitor::new(history_capacity);
        let (preempt, _) = watch::channel(0);
        Self {
            agent: RwLock::new(agent),
            status: monitor.subscribe(),
            monitor: tokio::sync::Mutex::new(monitor),
            ingress,
            dispatch,
            preempt,
            last_accepted: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn agent(&self) -> Agent {
        self.agent.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn id(&self) -> AgentId {
        self.agent.read().unwrap_or_else(|e| e.into_inner()).id.clone()
    }

    /// Current status without waiting on the monitor lock.
    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    fn replace_agent(&self, agent: Agent) {
        *self.agent.write().unwrap_or_else(|e| e.into_inner()) = agent;
    }

    /// Validate timestamp order and enqueue. Waits only for channel capacity.
    pub async fn submit(&self, snapshot: HealthSnapshot) -> Result<()> {
        let mut last = self.last_accepted.lock().await;
        if let Some(last_accepted) = *last {
            if snapshot.timestamp < last_accepted {
                return Err(SupervisorError::StaleSnapshot {
                    agent_id: snapshot.agent_id,
                    timestamp: snapshot.timestamp,
                    last_accepted,
                });
            }
        }

        let timestamp = snapshot.timestamp;
        let agent_id = snapshot.agent_id.clone();
        self.ingress
            .send(IngressMessage::Snapshot(snapshot))
            .await
            .map_err(|_| SupervisorError::IngressClosed(agent_id))?;
        *last = Some(timestamp);
        Ok(())
    }

    /// Wait until every snapshot accepted so far has been processed.
    pub async fn drain_ingress(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let closed = || SupervisorError::IngressClosed(self.id());
        self.ingress
            .send(IngressMessage::Flush(tx))
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Wait for accepted snapshots and then for the remediation deliveries
    /// they and earlier ticks produced.
    pub async fn flush(&self) -> Result<()> {
        self.drain_ingress().await?;

        let (tx, rx) = oneshot::channel();
        let closed = || SupervisorError::IngressClosed(self.id());
        self.dispatch
            .send(DispatchMessage::Flush(tx))
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Hand deliveries to the agent's dispatch task. Never waits.
    pub fn queue_deliveries(&self, deliveries: Vec<Delivery>) {
        let generation = *self.preempt.borrow();
        for delivery in deliveries {
            let message = DispatchMessage::Deliver {
                delivery,
                generation,
            };
            if self.dispatch.send(message).is_err() {
                log::debug!("Dispatch for {} closed, dropping delivery", self.id());
            }
        }
    }

    /// Cancel in-flight and queued deliveries. Returns the new generation.
    pub fn preempt(&self) -> u64 {
        self.preempt.send_modify(|generation| *generation += 1);
        *self.preempt.borrow()
    }

    pub fn preempt_signal(&self) -> watch::Receiver<u64> {
        self.preempt.subscribe()
    }

    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn stop(&self) {
        for handle in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
    }
}

pub enum Registration {
    Created {
        entry: Arc<AgentEntry>,
        ingress: mpsc::Receiver<IngressMessage>,
        dispatch: mpsc::UnboundedReceiver<DispatchMessage>,
    },
    Updated(Arc<AgentEntry>),
}

/// Single source of truth for registered agents and their breakers.
pub struct Registry {
    agents: RwLock<HashMap<AgentId, Arc<AgentEntry>>>,
    breakers: Arc<CircuitBreakerBank>,
    ingress_capacity: usize,
    history_capacity: usize,
}

impl Registry {
    pub fn new(
        breakers: Arc<CircuitBreakerBank>,
        ingress_capacity: usize,
        history_capacity: usize,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            breakers,
            ingress_capacity: ingress_capacity.max(1),
            history_capacity,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerBank> {
        &self.breakers
    }

    /// Insert a new agent or replace the config of an existing one. History,
    /// status and remediation state survive a re-registration.
    pub fn upsert(&self, agent: Agent) -> Registration {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = agents.get(&agent.id) {
            existing.replace_agent(agent);
            return Registration::Updated(existing.clone());
        }

        let (tx, rx) = mpsc::channel(self.ingress_capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let id = agent.id.clone();
        let entry = Arc::new(AgentEntry::new(agent, tx, dispatch_tx, self.history_capacity));
        agents.insert(id, entry.clone());
        Registration::Created {
            entry,
            ingress: rx,
            dispatch: dispatch_rx,
        }
    }

    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentEntry>> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
        if removed.is_some() {
            self.breakers.remove_agent(agent_id);
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Result<Arc<AgentEntry>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))
    }

    pub fn entries(&self) -> Vec<Arc<AgentEntry>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.entries().iter().map(|e| e.agent()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dependency_graph(&self) -> HashMap<AgentId, BTreeSet<AgentId>> {
        self.entries()
            .iter()
            .map(|e| {
                let agent = e.agent();
                (agent.id, agent.dependencies)
            })
            .collect()
    }
}
