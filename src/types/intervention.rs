use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, InterventionId, IssueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum InterventionLevel {
    Graceful = 1,
    Restart = 2,
    Isolate = 3,
    Emergency = 4,
}

impl InterventionLevel {
    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &str {
        match self {
            InterventionLevel::Graceful => "graceful",
            InterventionLevel::Restart => "restart",
            InterventionLevel::Isolate => "isolate",
            InterventionLevel::Emergency => "emergency",
        }
    }
}

impl TryFrom<u8> for InterventionLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(InterventionLevel::Graceful),
            2 => Ok(InterventionLevel::Restart),
            3 => Ok(InterventionLevel::Isolate),
            4 => Ok(InterventionLevel::Emergency),
            other => Err(format!("intervention level must be 1..=4, got {}", other)),
        }
    }
}

impl From<InterventionLevel> for u8 {
    fn from(level: InterventionLevel) -> Self {
        level.number()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionOutcome {
    Resolved,
    Escalated,
    Failed,
}

/// Audit entry for one level of one escalation chain.
///
/// Opening a level appends the record with no outcome; closing it appends the
/// completed copy under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub id: InterventionId,
    pub agent_id: AgentId,
    pub triggering_issue_id: IssueId,
    pub level: InterventionLevel,
    pub actions: Vec<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<InterventionOutcome>,
}

impl Intervention {
    pub fn open(
        agent_id: AgentId,
        triggering_issue_id: IssueId,
        level: InterventionLevel,
        actions: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InterventionId::new_v4(),
            agent_id,
            triggering_issue_id,
            level,
            actions,
            attempts: 0,
            started_at,
            completed_at: None,
            outcome: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn close(&mut self, outcome: InterventionOutcome, at: DateTime<Utc>) {
        self.outcome = Some(outcome);
        self.completed_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_serializes_as_number() {
        assert_eq!(serde_json::to_string(&InterventionLevel::Isolate).unwrap(), "3");
        let level: InterventionLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, InterventionLevel::Restart);
    }

    #[test]
    fn test_level_out_of_range() {
        assert!(InterventionLevel::try_from(0).is_err());
        assert!(InterventionLevel::try_from(5).is_err());
        assert!(serde_json::from_str::<InterventionLevel>("7").is_err());
    }

    #[test]
    fn test_close_sets_outcome() {
        let mut intervention = Intervention::open(
            "a".to_string(),
            IssueId::new_v4(),
            InterventionLevel::Graceful,
            vec!["clear_cache".to_string()],
            Utc::now(),
        );
        assert!(intervention.is_active());

        intervention.close(InterventionOutcome::Resolved, Utc::now());
        assert!(!intervention.is_active());
        assert!(intervention.completed_at.is_some());
    }
}
