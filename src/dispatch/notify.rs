use async_trait::async_trait;

use crate::types::{Agent, Intervention, Issue};

/// Human escalation channel used when automated remediation is exhausted.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn escalate(&self, agent: &Agent, issue: &Issue, intervention: &Intervention);
}

/// Writes escalations to the error log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn escalate(&self, agent: &Agent, issue: &Issue, intervention: &Intervention) {
        log::error!(
            "Operator attention required for {} ({}): {} [{}] escalated to level {} (intervention {})",
            agent.id,
            agent.agent_type,
            issue.issue_type.as_str(),
            issue.severity.as_str(),
            intervention.level.number(),
            intervention.id
        );
    }
}
