use async_trait::async_trait;
use serde_json::json;

use super::{AgentCommand, AgentCommandSink};
use crate::error::{Result, SupervisorError};
use crate::types::Agent;

/// Delivers commands by POSTing JSON to the agent's `callback_url`.
pub struct HttpCommandSink {
    client: reqwest::Client,
}

impl HttpCommandSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpCommandSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentCommandSink for HttpCommandSink {
    async fn deliver(&self, agent: &Agent, command: &AgentCommand) -> Result<()> {
        let failed = |reason: String| SupervisorError::CommandDeliveryFailed {
            agent_id: agent.id.clone(),
            command: command.name().to_string(),
            reason,
        };

        let url = agent
            .callback_url
            .as_deref()
            .ok_or_else(|| failed("agent has no callback_url".to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&json!({
                "agent_id": agent.id,
                "command": command,
            }))
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {}: {}", status, body)));
        }

        log::debug!("Delivered {} to {}", command.name(), agent.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_callback_is_delivery_failure() {
        let sink = HttpCommandSink::new();
        let agent = Agent::new("a", "code_writer");

        let err = sink
            .deliver(&agent, &AgentCommand::ForceRestart)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::CommandDeliveryFailed { ref command, .. } if command == "force_restart"
        ));
    }
}
