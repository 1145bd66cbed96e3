use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, HealthSnapshot, IssueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    RepetitiveAction,
    CircularDependency,
    ResourceExhaustion,
    ResponseTimeout,
    ErrorSpike,
    AgentStuck,
    PredictedDegradation,
    ManualOverride,
}

impl IssueType {
    pub fn as_str(&self) -> &str {
        match self {
            IssueType::RepetitiveAction => "repetitive_action",
            IssueType::CircularDependency => "circular_dependency",
            IssueType::ResourceExhaustion => "resource_exhaustion",
            IssueType::ResponseTimeout => "response_timeout",
            IssueType::ErrorSpike => "error_spike",
            IssueType::AgentStuck => "agent_stuck",
            IssueType::PredictedDegradation => "predicted_degradation",
            IssueType::ManualOverride => "manual_override",
        }
    }

    /// Advisory issues may open a Level-1 remediation but never escalate it.
    pub fn is_advisory(&self) -> bool {
        matches!(self, IssueType::PredictedDegradation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A single detector finding attached to an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub snapshots: Vec<HealthSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub agent_id: AgentId,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// Primary finding first, then lower-ranked findings from the same pass.
    pub evidence: Vec<Evidence>,
}

impl Issue {
    pub fn from_evidence(
        agent_id: AgentId,
        detected_at: DateTime<Utc>,
        evidence: Vec<Evidence>,
    ) -> Option<Self> {
        let primary = evidence.first()?;
        Some(Self {
            id: IssueId::new_v4(),
            agent_id,
            issue_type: primary.issue_type,
            severity: primary.severity,
            detected_at,
            evidence,
        })
    }

    pub fn manual(
        agent_id: AgentId,
        detected_at: DateTime<Utc>,
        severity: Severity,
        reason: &str,
    ) -> Self {
        Self {
            id: IssueId::new_v4(),
            agent_id,
            issue_type: IssueType::ManualOverride,
            severity,
            detected_at,
            evidence: vec![Evidence {
                issue_type: IssueType::ManualOverride,
                severity,
                description: reason.to_string(),
                snapshots: Vec::new(),
            }],
        }
    }

    pub fn summary(&self) -> &str {
        self.evidence
            .first()
            .map(|e| e.description.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_issue_takes_primary_finding() {
        let evidence = vec![
            Evidence {
                issue_type: IssueType::ResourceExhaustion,
                severity: Severity::Critical,
                description: "memory".to_string(),
                snapshots: vec![],
            },
            Evidence {
                issue_type: IssueType::RepetitiveAction,
                severity: Severity::Medium,
                description: "loop".to_string(),
                snapshots: vec![],
            },
        ];
        let issue = Issue::from_evidence("a".to_string(), Utc::now(), evidence).unwrap();

        assert_eq!(issue.issue_type, IssueType::ResourceExhaustion);
        assert_eq!(issue.severity, Severity::Critical);
        assert_eq!(issue.evidence.len(), 2);
        assert_eq!(issue.summary(), "memory");
    }

    #[test]
    fn test_no_evidence_no_issue() {
        assert!(Issue::from_evidence("a".to_string(), Utc::now(), vec![]).is_none());
    }

    #[test]
    fn test_issue_wire_format() {
        let issue = Issue::manual("a".to_string(), Utc::now(), Severity::High, "operator");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["type"], "manual_override");
        assert_eq!(json["severity"], "high");
    }
}
