use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::AgentId;

/// One heartbeat/health report from an agent. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    /// Free-form status string reported by the agent itself ("ok", "busy", ...).
    #[serde(default)]
    pub status: Option<String>,
    pub response_time_ms: u64,
    /// Errors since the previous report.
    #[serde(default)]
    pub error_count: u64,
    /// Requests handled since the previous report.
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub operation: Option<OperationClass>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_pct: f64,
    pub cpu_pct: f64,
}

impl ResourceUsage {
    pub fn peak(&self) -> f64 {
        self.memory_pct.max(self.cpu_pct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    ApiCall,
    StorageOp,
    Computation,
}

impl OperationClass {
    pub fn as_str(&self) -> &str {
        match self {
            OperationClass::ApiCall => "api_call",
            OperationClass::StorageOp => "storage_op",
            OperationClass::Computation => "computation",
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            OperationClass::ApiCall => Duration::from_secs(30),
            OperationClass::StorageOp => Duration::from_secs(10),
            OperationClass::Computation => Duration::from_secs(60),
        }
    }
}

impl HealthSnapshot {
    pub fn new(agent_id: impl Into<AgentId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp,
            status: None,
            response_time_ms: 0,
            error_count: 0,
            request_count: 0,
            consecutive_errors: 0,
            resource_usage: ResourceUsage::default(),
            current_task: None,
            operation: None,
        }
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    pub fn with_errors(mut self, error_count: u64, request_count: u64) -> Self {
        self.error_count = error_count;
        self.request_count = request_count;
        self
    }

    pub fn with_consecutive_errors(mut self, consecutive: u32) -> Self {
        self.consecutive_errors = consecutive;
        self
    }

    pub fn with_usage(mut self, memory_pct: f64, cpu_pct: f64) -> Self {
        self.resource_usage = ResourceUsage {
            memory_pct,
            cpu_pct,
        };
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }

    pub fn with_operation(mut self, operation: OperationClass) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn reported_error(&self) -> bool {
        self.error_count > 0
    }
}
