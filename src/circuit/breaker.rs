use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;
use crate::error::{Result, SupervisorError};
use crate::types::{AgentId, BreakerStatus};

/// What a caller may do after acquiring a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, traffic flows normally.
    Pass,
    /// The single half-open probe. Its outcome decides the next state.
    Probe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub agent_id: AgentId,
    pub state: BreakerStatus,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// While open: when the probe is admitted. While half-open: when an
    /// unreported probe expires and another may be admitted.
    pub next_probe_at: Option<DateTime<Utc>>,
    /// Consecutive opens without an intervening close; drives backoff.
    pub opens: u32,
    #[serde(skip)]
    probe_in_flight: bool,
}

impl CircuitBreakerState {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            state: BreakerStatus::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_probe_at: None,
            opens: 0,
            probe_in_flight: false,
        }
    }

    pub fn backoff(&self, config: &BreakerConfig) -> Duration {
        let factor = 2u64.saturating_pow(self.opens.min(16));
        let secs = config
            .base_backoff_secs
            .saturating_mul(factor)
            .min(config.max_backoff_secs);
        Duration::seconds(secs as i64)
    }

    pub fn try_acquire(
        &mut self,
        now: DateTime<Utc>,
        config: &BreakerConfig,
    ) -> Result<Admission> {
        let probe_at = self.next_probe_at.unwrap_or(now);
        match self.state {
            BreakerStatus::Closed => Ok(Admission::Pass),
            BreakerStatus::Open | BreakerStatus::HalfOpen if now < probe_at => {
                if self.state == BreakerStatus::HalfOpen && !self.probe_in_flight {
                    return Ok(self.admit_probe(now, config));
                }
                Err(self.rejection(probe_at))
            }
            BreakerStatus::Open | BreakerStatus::HalfOpen => {
                if self.probe_in_flight {
                    log::warn!(
                        "Probe for {} never reported an outcome, admitting another",
                        self.agent_id
                    );
                }
                Ok(self.admit_probe(now, config))
            }
        }
    }

    fn admit_probe(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> Admission {
        self.state = BreakerStatus::HalfOpen;
        self.probe_in_flight = true;
        self.next_probe_at = Some(now + self.backoff(config));
        Admission::Probe
    }

    fn rejection(&self, next_probe_at: DateTime<Utc>) -> SupervisorError {
        SupervisorError::CircuitOpenRejected {
            agent_id: self.agent_id.clone(),
            next_probe_at,
        }
    }

    /// Returns the new state if it changed.
    pub fn record_success(&mut self) -> Option<BreakerStatus> {
        self.failure_count = 0;
        match self.state {
            BreakerStatus::HalfOpen => {
                self.close();
                Some(BreakerStatus::Closed)
            }
            _ => None,
        }
    }

    /// Returns the new state if it changed.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        config: &BreakerConfig,
    ) -> Option<BreakerStatus> {
        self.last_failure_at = Some(now);
        match self.state {
            BreakerStatus::Closed => {
                self.failure_count += 1;
                if self.failure_count >= config.failure_threshold {
                    self.open(now, config);
                    Some(BreakerStatus::Open)
                } else {
                    None
                }
            }
            BreakerStatus::HalfOpen => {
                self.failure_count += 1;
                self.open(now, config);
                Some(BreakerStatus::Open)
            }
            // Failures reported while open came from calls admitted earlier.
            BreakerStatus::Open => None,
        }
    }

    pub fn open(&mut self, now: DateTime<Utc>, config: &BreakerConfig) {
        let backoff = self.backoff(config);
        self.state = BreakerStatus::Open;
        self.next_probe_at = Some(now + backoff);
        self.opens = self.opens.saturating_add(1);
        self.probe_in_flight = false;
    }

    pub fn close(&mut self) {
        self.state = BreakerStatus::Closed;
        self.failure_count = 0;
        self.next_probe_at = None;
        self.opens = 0;
        self.probe_in_flight = false;
    }

    /// State as seen at `now`: an open breaker whose backoff elapsed reports
    /// as half-open even before the probe is taken.
    pub fn effective_state(&self, now: DateTime<Utc>) -> BreakerStatus {
        match (self.state, self.next_probe_at) {
            (BreakerStatus::Open, Some(at)) if now >= at => BreakerStatus::HalfOpen,
            (state, _) => state,
        }
    }
}
