use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::breaker::{Admission, CircuitBreakerState};
use crate::config::BreakerConfig;
use crate::error::{Result, SupervisorError};
use crate::types::{AgentId, BreakerStatus, OperationClass};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub agent_id: AgentId,
    pub operation: Option<OperationClass>,
}

impl BreakerKey {
    pub fn agent(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            operation: None,
        }
    }

    pub fn operation(agent_id: &str, operation: OperationClass) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            operation: Some(operation),
        }
    }
}

/// One breaker per agent, plus optional per-operation-class breakers.
///
/// Each breaker sits behind its own mutex so gating different agents never
/// contends beyond the brief map lookup.
pub struct CircuitBreakerBank {
    config: BreakerConfig,
    breakers: RwLock<HashMap<BreakerKey, Arc<Mutex<CircuitBreakerState>>>>,
}

impl CircuitBreakerBank {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &BreakerKey) -> Arc<Mutex<CircuitBreakerState>> {
        if let Some(existing) = self.read_map().get(key) {
            return existing.clone();
        }

        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreakerState::new(key.agent_id.clone())))
            })
            .clone()
    }

    /// Read a breaker without creating it.
    fn peek<T>(&self, key: &BreakerKey, f: impl FnOnce(&CircuitBreakerState) -> T) -> Option<T> {
        let breaker = self.read_map().get(key).cloned()?;
        let guard = breaker.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&guard))
    }

    fn read_map(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<BreakerKey, Arc<Mutex<CircuitBreakerState>>>> {
        self.breakers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn with_breaker<T>(
        &self,
        key: &BreakerKey,
        f: impl FnOnce(&mut CircuitBreakerState) -> T,
    ) -> T {
        let breaker = self.entry(key);
        let mut guard = breaker.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn agent_breakers(&self, agent_id: &str) -> Vec<Arc<Mutex<CircuitBreakerState>>> {
        self.read_map()
            .iter()
            .filter(|(k, _)| k.agent_id == agent_id)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn try_acquire(&self, key: &BreakerKey, now: DateTime<Utc>) -> Result<Admission> {
        if key.operation.is_some() {
            // A forced-open agent breaker gates every operation class.
            let agent_key = BreakerKey::agent(&key.agent_id);
            let agent_state =
                self.peek(&agent_key, |b| (b.effective_state(now), b.next_probe_at));
            if let Some((BreakerStatus::Open, Some(next_probe_at))) = agent_state {
                return Err(SupervisorError::CircuitOpenRejected {
                    agent_id: key.agent_id.clone(),
                    next_probe_at,
                });
            }
        }

        let config = &self.config;
        let admission = self.with_breaker(key, |b| b.try_acquire(now, config));
        if let Ok(Admission::Probe) = admission {
            log::info!(
                "Circuit for {} ({}) half-open, admitting probe",
                key.agent_id,
                key.operation.map(|o| o.as_str().to_string()).unwrap_or_else(|| "agent".into())
            );
        }
        admission
    }

    pub fn record_success(&self, key: &BreakerKey) -> Option<BreakerStatus> {
        let change = self.with_breaker(key, |b| b.record_success());
        if change.is_some() {
            log::info!("Circuit for {} closed after successful probe", key.agent_id);
        }
        change
    }

    pub fn record_failure(&self, key: &BreakerKey, now: DateTime<Utc>) -> Option<BreakerStatus> {
        let config = &self.config;
        let change = self.with_breaker(key, |b| b.record_failure(now, config));
        if change == Some(BreakerStatus::Open) {
            log::warn!("Circuit for {} opened", key.agent_id);
        }
        change
    }

    /// Open the agent-level breaker regardless of failure count.
    pub fn force_open(&self, agent_id: &str, now: DateTime<Utc>) {
        let config = &self.config;
        self.with_breaker(&BreakerKey::agent(agent_id), |b| {
            if b.state != BreakerStatus::Open {
                b.open(now, config);
            }
        });
        log::warn!("Circuit for {} forced open", agent_id);
    }

    /// Close every breaker belonging to the agent.
    pub fn force_close(&self, agent_id: &str) {
        for breaker in self.agent_breakers(agent_id) {
            breaker.lock().unwrap_or_else(|e| e.into_inner()).close();
        }
        log::info!("Circuits for {} forced closed", agent_id);
    }

    /// Current state; an agent that never tripped reads as a fresh closed
    /// breaker.
    pub fn state(&self, key: &BreakerKey) -> CircuitBreakerState {
        self.peek(key, |b| b.clone())
            .unwrap_or_else(|| CircuitBreakerState::new(key.agent_id.clone()))
    }

    pub fn states_for(&self, agent_id: &str) -> Vec<CircuitBreakerState> {
        self.agent_breakers(agent_id)
            .into_iter()
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect()
    }

    pub fn is_open(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.peek(&BreakerKey::agent(agent_id), |b| {
            b.effective_state(now) == BreakerStatus::Open
        })
        .unwrap_or(false)
    }

    pub fn remove_agent(&self, agent_id: &str) {
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|k, _| k.agent_id != agent_id);
    }
}
