use chrono::{DateTime, Utc};

use crate::types::{AgentId, InterventionLevel};

/// Errors produced by the supervisor core.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("stale snapshot for {agent_id}: {timestamp} is older than last accepted {last_accepted}")]
    StaleSnapshot {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
        last_accepted: DateTime<Utc>,
    },

    #[error("intervention level {level:?} for {agent_id} timed out after {timeout_secs}s")]
    InterventionTimeout {
        agent_id: AgentId,
        level: InterventionLevel,
        timeout_secs: u64,
    },

    #[error("command {command} to {agent_id} failed: {reason}")]
    CommandDeliveryFailed {
        agent_id: AgentId,
        command: String,
        reason: String,
    },

    #[error("circuit open for {agent_id}, next probe at {next_probe_at}")]
    CircuitOpenRejected {
        agent_id: AgentId,
        next_probe_at: DateTime<Utc>,
    },

    #[error("escalation exhausted for {agent_id}: human operator required")]
    EscalationExhausted { agent_id: AgentId },

    #[error("ingress for {0} is closed")]
    IngressClosed(AgentId),

    #[error("invalid intervention level: {0}")]
    InvalidLevel(u8),

    #[error("agent {0} is not isolated")]
    NotIsolated(AgentId),

    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("audit store error: {0}")]
    Audit(String),
}

impl SupervisorError {
    pub fn audit(err: anyhow::Error) -> Self {
        SupervisorError::Audit(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
