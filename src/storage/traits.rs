use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::lifecycle::LifecycleEvent;
use crate::types::{
    Agent, AgentId, AgentStatus, BreakerStatus, Intervention, InterventionId, InterventionLevel,
    Issue, IssueId, OperationClass,
};

/// Operator actions taken through the override API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    EmergencyStop,
    ManualIntervene { level: InterventionLevel },
    ClearIsolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Registered {
        agent: Agent,
        replaced: bool,
    },
    Deregistered {
        agent_id: AgentId,
    },
    Transition {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
        event: LifecycleEvent,
    },
    IssueRaised {
        issue: Issue,
    },
    IssueQueued {
        agent_id: AgentId,
        issue_id: IssueId,
    },
    IssueSuperseded {
        agent_id: AgentId,
        issue_id: IssueId,
        superseded_by: IssueId,
    },
    InterventionRecorded {
        intervention: Intervention,
    },
    BreakerChanged {
        agent_id: AgentId,
        operation: Option<OperationClass>,
        state: BreakerStatus,
    },
    EscalationExhausted {
        agent_id: AgentId,
        issue_id: IssueId,
        intervention_id: InterventionId,
    },
    OperatorOverride {
        agent_id: Option<AgentId>,
        action: OverrideAction,
    },
}

impl AuditRecord {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            AuditRecord::Registered { agent, .. } => Some(&agent.id),
            AuditRecord::IssueRaised { issue } => Some(&issue.agent_id),
            AuditRecord::InterventionRecorded { intervention } => Some(&intervention.agent_id),
            AuditRecord::OperatorOverride { agent_id, .. } => agent_id.as_deref(),
            AuditRecord::Deregistered { agent_id }
            | AuditRecord::Transition { agent_id, .. }
            | AuditRecord::IssueQueued { agent_id, .. }
            | AuditRecord::IssueSuperseded { agent_id, .. }
            | AuditRecord::BreakerChanged { agent_id, .. }
            | AuditRecord::EscalationExhausted { agent_id, .. } => Some(agent_id),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            AuditRecord::Registered { .. } => "registered",
            AuditRecord::Deregistered { .. } => "deregistered",
            AuditRecord::Transition { .. } => "transition",
            AuditRecord::IssueRaised { .. } => "issue_raised",
            AuditRecord::IssueQueued { .. } => "issue_queued",
            AuditRecord::IssueSuperseded { .. } => "issue_superseded",
            AuditRecord::InterventionRecorded { .. } => "intervention_recorded",
            AuditRecord::BreakerChanged { .. } => "breaker_changed",
            AuditRecord::EscalationExhausted { .. } => "escalation_exhausted",
            AuditRecord::OperatorOverride { .. } => "operator_override",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub record: AuditRecord,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub agent_id: Option<AgentId>,
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_agent(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if entry.record.agent_id() != Some(agent_id.as_str()) {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if entry.record.kind() != kind.as_str() {
                return false;
            }
        }
        match self.since {
            Some(since) => entry.at >= since,
            None => true,
        }
    }
}

/// A Level-4 escalation still waiting on an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenEscalation {
    pub agent_id: AgentId,
    pub issue_id: IssueId,
    pub intervention_id: InterventionId,
    pub escalated_at: DateTime<Utc>,
}

/// Append-only audit log. Nothing recorded here is ever updated in place.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, at: DateTime<Utc>, record: AuditRecord) -> Result<AuditEntry>;
    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Latest version of every intervention, oldest first.
    async fn interventions(&self, agent_id: Option<&str>) -> Result<Vec<Intervention>>;
    async fn issues(&self, agent_id: Option<&str>) -> Result<Vec<Issue>>;

    /// Escalations not yet followed by a clear-isolation override.
    async fn open_escalations(&self) -> Result<Vec<OpenEscalation>>;

    fn subscribe(&self) -> broadcast::Receiver<AuditEntry>;
}
