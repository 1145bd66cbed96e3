use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::AgentId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub dependencies: BTreeSet<AgentId>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Where HTTP-delivered commands are posted.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub rate_limit_per_min: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_cores: 1.0,
            rate_limit_per_min: 60,
        }
    }
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            dependencies: BTreeSet::new(),
            resource_limits: ResourceLimits::default(),
            callback_url: None,
            registered_at: Utc::now(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on(&self, other: &str) -> bool {
        self.dependencies.contains(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_serializes_as_type() {
        let agent = Agent::new("writer-1", "code_writer");
        let json = serde_json::to_value(&agent).unwrap();

        assert_eq!(json["type"], "code_writer");
        assert_eq!(json["id"], "writer-1");
    }

    #[test]
    fn test_minimal_registration_payload() {
        let agent: Agent =
            serde_json::from_str(r#"{"id": "a1", "type": "issue_manager"}"#).unwrap();

        assert!(agent.dependencies.is_empty());
        assert_eq!(agent.resource_limits, ResourceLimits::default());
        assert!(agent.callback_url.is_none());
    }

    #[test]
    fn test_with_dependencies() {
        let agent = Agent::new("a", "worker").with_dependencies(["b", "c"]);
        assert!(agent.depends_on("b"));
        assert!(agent.depends_on("c"));
        assert!(!agent.depends_on("a"));
    }
}
