use async_stream::stream;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

use crate::api::error::ApiError;
use crate::circuit::{Admission, CircuitBreakerState};
use crate::storage::{AuditEntry, AuditFilter, OpenEscalation};
use crate::supervisor::{AgentView, Overview, Supervisor};
use crate::types::{
    Agent, AgentStatus, BreakerStatus, HealthSnapshot, Intervention, Issue, OperationClass,
    ResourceUsage,
};

/// Health report body. The agent id comes from the path; a missing
/// timestamp means "now".
#[derive(Debug, Deserialize)]
pub struct HealthReport {
    pub timestamp: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub response_time_ms: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    pub current_task: Option<String>,
    pub operation: Option<OperationClass>,
}

impl HealthReport {
    fn into_snapshot(self, agent_id: String) -> HealthSnapshot {
        HealthSnapshot {
            agent_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            status: self.status,
            response_time_ms: self.response_time_ms,
            error_count: self.error_count,
            request_count: self.request_count,
            consecutive_errors: self.consecutive_errors,
            resource_usage: self.resource_usage,
            current_task: self.current_task,
            operation: self.operation,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    #[serde(flatten)]
    pub agent: Agent,
    pub status: AgentStatus,
}

#[derive(Debug, Deserialize)]
pub struct InterveneRequest {
    pub level: u8,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    pub agent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TrafficRequest {
    pub operation: Option<OperationClass>,
}

#[derive(Debug, Deserialize)]
pub struct TrafficOutcome {
    pub operation: Option<OperationClass>,
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub admitted: bool,
    pub probe: bool,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_config(State(supervisor): State<Supervisor>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "config": supervisor.config(),
    }))
}

pub async fn register_agent(
    State(supervisor): State<Supervisor>,
    Json(agent): Json<Agent>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if agent.id.trim().is_empty() {
        return Err(ApiError::bad_request("agent id must not be empty"));
    }
    let id = supervisor.register(agent).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "id": id }))))
}

pub async fn list_agents(State(supervisor): State<Supervisor>) -> Json<Vec<AgentSummary>> {
    let registry = supervisor.registry();
    let summaries = supervisor
        .agents()
        .into_iter()
        .filter_map(|agent| {
            let status = registry.get(&agent.id).ok()?.status();
            Some(AgentSummary { agent, status })
        })
        .collect();
    Json(summaries)
}

pub async fn get_agent(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<Json<AgentView>, ApiError> {
    Ok(Json(supervisor.agent_view(&id).await?))
}

pub async fn deregister_agent(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    supervisor.deregister(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report_health(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
    Json(report): Json<HealthReport>,
) -> Result<StatusCode, ApiError> {
    supervisor.report_health(report.into_snapshot(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn get_history(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HealthSnapshot>>, ApiError> {
    Ok(Json(supervisor.history(&id).await?))
}

pub async fn get_breakers(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CircuitBreakerState>>, ApiError> {
    Ok(Json(supervisor.breakers(&id)?))
}

pub async fn admit_traffic(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
    Json(request): Json<TrafficRequest>,
) -> Result<Json<AdmissionResponse>, ApiError> {
    let admission = supervisor.admit_traffic(&id, request.operation, Utc::now())?;
    Ok(Json(AdmissionResponse {
        admitted: true,
        probe: admission == Admission::Probe,
    }))
}

pub async fn report_traffic_outcome(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
    Json(outcome): Json<TrafficOutcome>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let change: Option<BreakerStatus> = supervisor
        .report_traffic_outcome(&id, outcome.operation, outcome.success, Utc::now())
        .await?;
    Ok(Json(serde_json::json!({ "breaker_changed_to": change })))
}

pub async fn intervene(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
    Json(request): Json<InterveneRequest>,
) -> Result<StatusCode, ApiError> {
    supervisor
        .manual_intervene(&id, request.level, Utc::now())
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn clear_isolation(
    State(supervisor): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    supervisor.clear_isolation(&id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn emergency_stop(State(supervisor): State<Supervisor>) -> Json<serde_json::Value> {
    let stopped = supervisor.emergency_stop_all(Utc::now()).await;
    Json(serde_json::json!({ "stopped": stopped }))
}

pub async fn get_overview(
    State(supervisor): State<Supervisor>,
) -> Result<Json<Overview>, ApiError> {
    Ok(Json(supervisor.overview().await?))
}

pub async fn list_interventions(
    State(supervisor): State<Supervisor>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<Vec<Intervention>>, ApiError> {
    Ok(Json(
        supervisor.interventions(query.agent_id.as_deref()).await?,
    ))
}

pub async fn list_issues(
    State(supervisor): State<Supervisor>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<Vec<Issue>>, ApiError> {
    Ok(Json(supervisor.issues(query.agent_id.as_deref()).await?))
}

pub async fn list_escalations(
    State(supervisor): State<Supervisor>,
) -> Result<Json<Vec<OpenEscalation>>, ApiError> {
    Ok(Json(supervisor.escalations().await?))
}

pub async fn list_audit(
    State(supervisor): State<Supervisor>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    Ok(Json(supervisor.audit_entries(&filter).await?))
}

/// Live audit feed. Slow consumers skip what they missed.
pub async fn stream_events(
    State(supervisor): State<Supervisor>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = supervisor.audit_store().subscribe();

    let events = stream! {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    let data = serde_json::to_string(&entry).unwrap_or_default();
                    yield Ok(Event::default().event(entry.record.kind()).data(data));
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event stream lagged, skipped {} records", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}
