use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

use super::{AgentCommand, AgentCommandSink};
use crate::error::{Result, SupervisorError};
use crate::types::{Agent, AgentId};

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub agent_id: AgentId,
    pub command: AgentCommand,
}

/// Command sink for agents running in the same process, each attached
/// through its own bounded channel.
#[derive(Default)]
pub struct ChannelCommandSink {
    routes: RwLock<HashMap<AgentId, mpsc::Sender<CommandEnvelope>>>,
}

impl ChannelCommandSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an agent and return the receiving end of its command channel.
    pub fn attach(&self, agent_id: &str, capacity: usize) -> mpsc::Receiver<CommandEnvelope> {
        let (tx, rx) = mpsc::channel(capacity);
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), tx);
        rx
    }

    pub fn detach(&self, agent_id: &str) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
    }

    fn route(&self, agent_id: &str) -> Option<mpsc::Sender<CommandEnvelope>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }
}

#[async_trait]
impl AgentCommandSink for ChannelCommandSink {
    async fn deliver(&self, agent: &Agent, command: &AgentCommand) -> Result<()> {
        let failed = |reason: &str| SupervisorError::CommandDeliveryFailed {
            agent_id: agent.id.clone(),
            command: command.name().to_string(),
            reason: reason.to_string(),
        };

        let tx = self.route(&agent.id).ok_or_else(|| failed("agent not attached"))?;
        tx.send(CommandEnvelope {
            agent_id: agent.id.clone(),
            command: command.clone(),
        })
        .await
        .map_err(|_| failed("command channel closed"))
    }
}
