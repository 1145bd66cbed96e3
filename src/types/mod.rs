pub mod agent;
pub mod intervention;
pub mod issue;
pub mod snapshot;

pub use agent::{Agent, ResourceLimits};
pub use intervention::{Intervention, InterventionLevel, InterventionOutcome};
pub use issue::{Evidence, Issue, IssueType, Severity};
pub use snapshot::{HealthSnapshot, OperationClass, ResourceUsage};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = String;
pub type IssueId = Uuid;
pub type InterventionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Healthy,    // Within all thresholds
    Degraded,   // Slow responses or elevated error rate
    Stuck,      // Silent past 2x heartbeat, or repeated consecutive errors
    Failed,     // Critical resource usage or failed restart-level remediation
    Restarting, // Restart issued, waiting for recovery criteria
    Isolated,   // Cut off from traffic until an operator clears it
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Stuck => "stuck",
            AgentStatus::Failed => "failed",
            AgentStatus::Restarting => "restarting",
            AgentStatus::Isolated => "isolated",
        }
    }

    /// Degraded or anything past it.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, AgentStatus::Healthy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BreakerStatus::Closed => "closed",
            BreakerStatus::Open => "open",
            BreakerStatus::HalfOpen => "half_open",
        }
    }
}
