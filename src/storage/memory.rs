use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::traits::{
    AuditEntry, AuditFilter, AuditRecord, AuditStore, OpenEscalation, OverrideAction,
};
use crate::types::{Intervention, InterventionId, Issue};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct InMemoryAuditStore {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    events: broadcast::Sender<AuditEntry>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_agent(agent_id: Option<&str>, candidate: &str) -> bool {
    agent_id.map_or(true, |id| id == candidate)
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, at: DateTime<Utc>, record: AuditRecord) -> Result<AuditEntry> {
        let entry = {
            let mut entries = self.entries.write().await;
            let entry = AuditEntry {
                seq: entries.len() as u64,
                at,
                record,
            };
            entries.push(entry.clone());
            entry
        };

        // No subscribers is fine.
        let _ = self.events.send(entry.clone());
        Ok(entry)
    }

    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }

    async fn interventions(&self, agent_id: Option<&str>) -> Result<Vec<Intervention>> {
        let entries = self.entries.read().await;
        let mut order: Vec<InterventionId> = Vec::new();
        let mut latest: HashMap<InterventionId, &Intervention> = HashMap::new();

        for entry in entries.iter() {
            if let AuditRecord::InterventionRecorded { intervention } = &entry.record {
                if !matches_agent(agent_id, &intervention.agent_id) {
                    continue;
                }
                if latest.insert(intervention.id, intervention).is_none() {
                    order.push(intervention.id);
                }
            }
        }

        Ok(order
            .iter()
            .filter_map(|id| latest.get(id).map(|i| (*i).clone()))
            .collect())
    }

    async fn issues(&self, agent_id: Option<&str>) -> Result<Vec<Issue>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter_map(|e| match &e.record {
                AuditRecord::IssueRaised { issue } if matches_agent(agent_id, &issue.agent_id) => {
                    Some(issue.clone())
                }
                _ => None,
            })
            .collect())
    }

    async fn open_escalations(&self) -> Result<Vec<OpenEscalation>> {
        let entries = self.entries.read().await;
        let mut open: Vec<OpenEscalation> = Vec::new();

        for entry in entries.iter() {
            match &entry.record {
                AuditRecord::EscalationExhausted {
                    agent_id,
                    issue_id,
                    intervention_id,
                } => open.push(OpenEscalation {
                    agent_id: agent_id.clone(),
                    issue_id: *issue_id,
                    intervention_id: *intervention_id,
                    escalated_at: entry.at,
                }),
                AuditRecord::OperatorOverride {
                    agent_id: Some(agent_id),
                    action: OverrideAction::ClearIsolation,
                }
                | AuditRecord::Deregistered { agent_id } => {
                    open.retain(|e| &e.agent_id != agent_id);
                }
                _ => {}
            }
        }

        Ok(open)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.events.subscribe()
    }
}
