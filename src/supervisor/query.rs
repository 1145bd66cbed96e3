use serde::{Deserialize, Serialize};

use super::Supervisor;
use crate::circuit::CircuitBreakerState;
use crate::error::{Result, SupervisorError};
use crate::intervention::ActiveRemediation;
use crate::storage::{AuditEntry, AuditFilter, OpenEscalation};
use crate::types::{
    Agent, AgentStatus, HealthSnapshot, Intervention, InterventionLevel, Issue, IssueId,
};

/// Fleet summary, projected on demand from the registry and the audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub stuck: usize,
    pub failed: usize,
    pub restarting: usize,
    pub isolated: usize,
    pub active_interventions: usize,
    pub open_escalations: usize,
}

impl Overview {
    fn count(&mut self, status: AgentStatus) {
        self.total += 1;
        match status {
            AgentStatus::Healthy => self.healthy += 1,
            AgentStatus::Degraded => self.degraded += 1,
            AgentStatus::Stuck => self.stuck += 1,
            AgentStatus::Failed => self.failed += 1,
            AgentStatus::Restarting => self.restarting += 1,
            AgentStatus::Isolated => self.isolated += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveInterventionView {
    pub issue_id: IssueId,
    pub level: InterventionLevel,
    pub attempts: u32,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub queued_issues: usize,
}

impl ActiveInterventionView {
    fn new(active: &ActiveRemediation, queued_issues: usize) -> Self {
        Self {
            issue_id: active.issue.id,
            level: active.record.level,
            attempts: active.record.attempts,
            deadline: active.deadline,
            queued_issues,
        }
    }
}

/// Current state of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub agent: Agent,
    pub status: AgentStatus,
    pub latest: Option<HealthSnapshot>,
    pub recovery_streak: u32,
    pub active_intervention: Option<ActiveInterventionView>,
    pub breakers: Vec<CircuitBreakerState>,
}

impl Supervisor {
    pub async fn overview(&self) -> Result<Overview> {
        let mut overview = Overview::default();
        for entry in self.registry.entries() {
            overview.count(entry.status());
        }

        let interventions = self.interventions(None).await?;
        overview.active_interventions = interventions.iter().filter(|i| i.is_active()).count();
        overview.open_escalations = self.escalations().await?.len();
        Ok(overview)
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.registry.agents()
    }

    pub async fn agent_view(&self, agent_id: &str) -> Result<AgentView> {
        let entry = self.registry.get(agent_id)?;
        let monitor = entry.monitor.lock().await;
        let remediation = &monitor.remediation;

        Ok(AgentView {
            agent: entry.agent(),
            status: monitor.status,
            latest: monitor.tracker.latest().cloned(),
            recovery_streak: monitor.tracker.recovery_streak(),
            active_intervention: remediation
                .active()
                .map(|a| ActiveInterventionView::new(a, remediation.queued().len())),
            breakers: self.registry.breakers().states_for(agent_id),
        })
    }

    /// Snapshot history, oldest first.
    pub async fn history(&self, agent_id: &str) -> Result<Vec<HealthSnapshot>> {
        let entry = self.registry.get(agent_id)?;
        let monitor = entry.monitor.lock().await;
        Ok(monitor.tracker.to_vec())
    }

    pub fn breakers(&self, agent_id: &str) -> Result<Vec<CircuitBreakerState>> {
        self.registry.get(agent_id)?;
        Ok(self.registry.breakers().states_for(agent_id))
    }

    /// Latest version of every intervention, optionally for one agent.
    pub async fn interventions(&self, agent_id: Option<&str>) -> Result<Vec<Intervention>> {
        self.audit_store()
            .interventions(agent_id)
            .await
            .map_err(SupervisorError::audit)
    }

    pub async fn issues(&self, agent_id: Option<&str>) -> Result<Vec<Issue>> {
        self.audit_store().issues(agent_id).await.map_err(SupervisorError::audit)
    }

    /// Level-4 escalations still waiting for an operator.
    pub async fn escalations(&self) -> Result<Vec<OpenEscalation>> {
        self.audit_store().open_escalations().await.map_err(SupervisorError::audit)
    }

    pub async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.audit_store().entries(filter).await.map_err(SupervisorError::audit)
    }
}
