pub mod channel;
pub mod http;
pub mod notify;

pub use channel::{ChannelCommandSink, CommandEnvelope};
pub use http::HttpCommandSink;
pub use notify::{LogNotifier, OperatorNotifier};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Agent, ResourceLimits};

/// Control commands the supervisor sends to a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AgentCommand {
    GracefulStop { grace_secs: u64 },
    ForceRestart,
    ParameterUpdate { key: String, value: serde_json::Value },
    ResourceLimit { limits: ResourceLimits },
    CircuitBreakerOpen,
    CircuitBreakerClose,
}

impl AgentCommand {
    pub fn name(&self) -> &str {
        match self {
            AgentCommand::GracefulStop { .. } => "graceful_stop",
            AgentCommand::ForceRestart => "force_restart",
            AgentCommand::ParameterUpdate { .. } => "parameter_update",
            AgentCommand::ResourceLimit { .. } => "resource_limit",
            AgentCommand::CircuitBreakerOpen => "circuit_breaker_open",
            AgentCommand::CircuitBreakerClose => "circuit_breaker_close",
        }
    }
}

/// Transport to the worker agents. Implementations return
/// `CommandDeliveryFailed` when the agent did not accept the command.
#[async_trait]
pub trait AgentCommandSink: Send + Sync {
    async fn deliver(&self, agent: &Agent, command: &AgentCommand) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(AgentCommand::GracefulStop { grace_secs: 10 }).unwrap();
        assert_eq!(json["command"], "graceful_stop");
        assert_eq!(json["grace_secs"], 10);

        let json = serde_json::to_value(AgentCommand::CircuitBreakerOpen).unwrap();
        assert_eq!(json, serde_json::json!({ "command": "circuit_breaker_open" }));
    }

    #[test]
    fn test_command_names() {
        assert_eq!(AgentCommand::ForceRestart.name(), "force_restart");
        let update = AgentCommand::ParameterUpdate {
            key: "clear_cache".into(),
            value: serde_json::json!(true),
        };
        assert_eq!(update.name(), "parameter_update");
    }
}
