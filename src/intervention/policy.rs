use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::dispatch::AgentCommand;
use crate::types::{Agent, InterventionLevel, Issue, IssueType, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    ClearCache,
    ResetLocalState,
    RetryOperation,
    CheckpointState,
    TerminateProcess,
    Restart,
    RestoreState,
    IsolateAgent,
    RerouteTraffic,
    SpinUpStandby,
    EmergencyShutdown,
    PreserveData,
    ActivateFallback,
    ApplyResourceLimits,
}

impl RemediationAction {
    pub fn as_str(&self) -> &str {
        match self {
            RemediationAction::ClearCache => "clear_cache",
            RemediationAction::ResetLocalState => "reset_local_state",
            RemediationAction::RetryOperation => "retry_operation",
            RemediationAction::CheckpointState => "checkpoint_state",
            RemediationAction::TerminateProcess => "terminate_process",
            RemediationAction::Restart => "restart",
            RemediationAction::RestoreState => "restore_state",
            RemediationAction::IsolateAgent => "isolate_agent",
            RemediationAction::RerouteTraffic => "reroute_traffic",
            RemediationAction::SpinUpStandby => "spin_up_standby",
            RemediationAction::EmergencyShutdown => "emergency_shutdown",
            RemediationAction::PreserveData => "preserve_data",
            RemediationAction::ActivateFallback => "activate_fallback",
            RemediationAction::ApplyResourceLimits => "apply_resource_limits",
        }
    }

    /// The egress command that carries this action to the agent.
    pub fn command(&self, agent: &Agent) -> AgentCommand {
        match self {
            RemediationAction::ApplyResourceLimits => AgentCommand::ResourceLimit {
                limits: agent.resource_limits.clone(),
            },
            RemediationAction::TerminateProcess => AgentCommand::GracefulStop { grace_secs: 10 },
            RemediationAction::Restart => AgentCommand::ForceRestart,
            RemediationAction::IsolateAgent => AgentCommand::CircuitBreakerOpen,
            RemediationAction::EmergencyShutdown => AgentCommand::GracefulStop { grace_secs: 0 },
            other => AgentCommand::ParameterUpdate {
                key: other.as_str().to_string(),
                value: json!(true),
            },
        }
    }
}

/// One row of the escalation table.
#[derive(Debug, Clone, Copy)]
pub struct LevelPolicy {
    pub level: InterventionLevel,
    pub actions: &'static [RemediationAction],
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub next: Option<InterventionLevel>,
    /// Whether commands at this level must pass the agent's circuit breaker.
    pub gated_by_breaker: bool,
}

impl LevelPolicy {
    /// The level's bundle for one issue. Restart and isolation of an agent
    /// that ran out of resources also push its registered limits.
    pub fn actions_for(&self, issue: &Issue) -> Vec<RemediationAction> {
        let mut actions = self.actions.to_vec();
        let enforce_limits = issue.issue_type == IssueType::ResourceExhaustion
            && matches!(
                self.level,
                InterventionLevel::Restart | InterventionLevel::Isolate
            );
        if enforce_limits {
            actions.push(RemediationAction::ApplyResourceLimits);
        }
        actions
    }

    pub fn action_names(&self, issue: &Issue) -> Vec<String> {
        self.actions_for(issue)
            .iter()
            .map(|a| a.as_str().to_string())
            .collect()
    }

    pub fn commands(&self, agent: &Agent, issue: &Issue) -> Vec<AgentCommand> {
        self.actions_for(issue)
            .iter()
            .map(|a| a.command(agent))
            .collect()
    }
}

pub const ESCALATION_TABLE: [LevelPolicy; 4] = [
    LevelPolicy {
        level: InterventionLevel::Graceful,
        actions: &[
            RemediationAction::ClearCache,
            RemediationAction::ResetLocalState,
            RemediationAction::RetryOperation,
        ],
        timeout: Some(Duration::from_secs(30)),
        max_attempts: Some(3),
        next: Some(InterventionLevel::Restart),
        gated_by_breaker: true,
    },
    LevelPolicy {
        level: InterventionLevel::Restart,
        actions: &[
            RemediationAction::CheckpointState,
            RemediationAction::TerminateProcess,
            RemediationAction::Restart,
            RemediationAction::RestoreState,
        ],
        timeout: Some(Duration::from_secs(60)),
        max_attempts: Some(2),
        next: Some(InterventionLevel::Isolate),
        gated_by_breaker: false,
    },
    LevelPolicy {
        level: InterventionLevel::Isolate,
        actions: &[
            RemediationAction::IsolateAgent,
            RemediationAction::RerouteTraffic,
            RemediationAction::SpinUpStandby,
        ],
        timeout: Some(Duration::from_secs(120)),
        max_attempts: Some(1),
        next: Some(InterventionLevel::Emergency),
        gated_by_breaker: false,
    },
    LevelPolicy {
        level: InterventionLevel::Emergency,
        actions: &[
            RemediationAction::EmergencyShutdown,
            RemediationAction::PreserveData,
            RemediationAction::ActivateFallback,
        ],
        timeout: None,
        max_attempts: None,
        next: None,
        gated_by_breaker: false,
    },
];

/// Bound on a single emergency-level delivery, which has no level timeout.
pub const EMERGENCY_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

pub fn policy(level: InterventionLevel) -> &'static LevelPolicy {
    &ESCALATION_TABLE[(level.number() - 1) as usize]
}

/// Critical issues skip the low-impact levels; everything else starts gently.
pub fn starting_level(issue: &Issue) -> InterventionLevel {
    match issue.severity {
        Severity::Critical if !issue.issue_type.is_advisory() => InterventionLevel::Isolate,
        _ => InterventionLevel::Graceful,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IssueType;
    use chrono::Utc;

    #[test]
    fn test_table_is_ordered_by_level() {
        for (i, row) in ESCALATION_TABLE.iter().enumerate() {
            assert_eq!(row.level.number() as usize, i + 1);
            if let Some(next) = row.next {
                assert!(next > row.level);
            }
        }
    }

    #[test]
    fn test_level_budgets() {
        assert_eq!(policy(InterventionLevel::Graceful).max_attempts, Some(3));
        assert_eq!(
            policy(InterventionLevel::Restart).timeout,
            Some(Duration::from_secs(60))
        );
        assert_eq!(policy(InterventionLevel::Isolate).max_attempts, Some(1));
        assert!(policy(InterventionLevel::Emergency).next.is_none());
    }

    #[test]
    fn test_only_level_one_is_breaker_gated() {
        assert!(policy(InterventionLevel::Graceful).gated_by_breaker);
        assert!(!policy(InterventionLevel::Restart).gated_by_breaker);
    }

    #[test]
    fn test_starting_level() {
        let mut issue = Issue::manual("a".to_string(), Utc::now(), Severity::High, "x");
        issue.issue_type = IssueType::ResponseTimeout;
        assert_eq!(starting_level(&issue), InterventionLevel::Graceful);

        issue.severity = Severity::Critical;
        assert_eq!(starting_level(&issue), InterventionLevel::Isolate);
    }

    #[test]
    fn test_action_commands() {
        let agent = Agent::new("a", "code_writer");
        assert_eq!(RemediationAction::Restart.command(&agent), AgentCommand::ForceRestart);
        assert_eq!(
            RemediationAction::IsolateAgent.command(&agent),
            AgentCommand::CircuitBreakerOpen
        );
        assert!(matches!(
            RemediationAction::ClearCache.command(&agent),
            AgentCommand::ParameterUpdate { ref key, .. } if key == "clear_cache"
        ));
    }

    #[test]
    fn test_resource_exhaustion_pushes_limits() {
        let mut agent = Agent::new("a", "code_writer");
        agent.resource_limits.memory_mb = 2048;
        let mut issue = Issue::manual("a".to_string(), Utc::now(), Severity::Critical, "x");
        issue.issue_type = IssueType::ResourceExhaustion;

        let commands = policy(InterventionLevel::Isolate).commands(&agent, &issue);
        assert_eq!(commands.len(), 4);
        assert_eq!(
            commands.last(),
            Some(&AgentCommand::ResourceLimit {
                limits: agent.resource_limits.clone()
            })
        );
        assert!(policy(InterventionLevel::Restart)
            .action_names(&issue)
            .contains(&"apply_resource_limits".to_string()));

        // Other levels and other issue types keep the plain bundle.
        assert_eq!(policy(InterventionLevel::Graceful).commands(&agent, &issue).len(), 3);
        issue.issue_type = IssueType::AgentStuck;
        assert_eq!(policy(InterventionLevel::Isolate).commands(&agent, &issue).len(), 3);
    }
}
