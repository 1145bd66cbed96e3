use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::supervisor::Supervisor;

pub fn create_router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/config", get(handlers::get_config))
        .route(
            "/agents",
            post(handlers::register_agent).get(handlers::list_agents),
        )
        .route(
            "/agents/:id",
            get(handlers::get_agent).delete(handlers::deregister_agent),
        )
        .route("/agents/:id/health", post(handlers::report_health))
        .route("/agents/:id/history", get(handlers::get_history))
        .route("/agents/:id/breaker", get(handlers::get_breakers))
        .route("/agents/:id/intervene", post(handlers::intervene))
        .route("/agents/:id/clear-isolation", post(handlers::clear_isolation))
        .route("/agents/:id/traffic/admit", post(handlers::admit_traffic))
        .route(
            "/agents/:id/traffic/outcome",
            post(handlers::report_traffic_outcome),
        )
        .route("/emergency-stop", post(handlers::emergency_stop))
        .route("/overview", get(handlers::get_overview))
        .route("/interventions", get(handlers::list_interventions))
        .route("/issues", get(handlers::list_issues))
        .route("/escalations", get(handlers::list_escalations))
        .route("/audit", get(handlers::list_audit))
        .route("/events", get(handlers::stream_events))
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}

/// Serve the operator API until `shutdown` flips to true.
pub async fn serve(
    supervisor: Supervisor,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = create_router(supervisor);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("Supervisor API listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::SupervisorConfig;
    use crate::dispatch::ChannelCommandSink;

    fn create_test_app() -> (Router, Supervisor) {
        let supervisor = Supervisor::new(
            SupervisorConfig::default(),
            Arc::new(ChannelCommandSink::new()),
        );
        (create_router(supervisor.clone()), supervisor)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_get_config() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert!(json["version"].is_string());
        assert!(json["config"]["detection"]["tick_secs"].is_number());
    }

    #[tokio::test]
    async fn test_register_and_list_agents() {
        let (app, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/agents",
                r#"{"id": "writer-1", "type": "code_writer", "dependencies": ["db-1"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["id"], "writer-1");

        let response = app
            .oneshot(Request::builder().uri("/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(response).await;
        let agents = json.as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["type"], "code_writer");
        assert_eq!(agents[0]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(post_json("/agents", r#"{"id": " ", "type": "code_writer"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/agents/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json("/agents/ghost/health", r#"{"response_time_ms": 10}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_report_health_and_history() {
        let (app, supervisor) = create_test_app();
        supervisor
            .register(crate::types::Agent::new("a", "code_writer"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/agents/a/health",
                r#"{"response_time_ms": 120, "resource_usage": {"memory_pct": 40.0, "cpu_pct": 20.0}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        supervisor.flush("a").await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/agents/a/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = json_body(response).await;
        let history = json.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["agent_id"], "a");
        assert_eq!(history[0]["response_time_ms"], 120);
    }

    #[tokio::test]
    async fn test_invalid_level_and_not_isolated() {
        let (app, supervisor) = create_test_app();
        supervisor
            .register(crate::types::Agent::new("a", "code_writer"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/agents/a/intervene", r#"{"level": 7}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json("/agents/a/clear-isolation", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_overview_counts_agents() {
        let (app, supervisor) = create_test_app();
        for id in ["a", "b"] {
            supervisor
                .register(crate::types::Agent::new(id, "code_writer"))
                .await
                .unwrap();
        }

        let response = app
            .oneshot(Request::builder().uri("/overview").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["total"], 2);
        assert_eq!(json["healthy"], 2);
        assert_eq!(json["open_escalations"], 0);
    }

    #[tokio::test]
    async fn test_audit_filter_by_kind() {
        let (app, supervisor) = create_test_app();
        supervisor
            .register(crate::types::Agent::new("a", "code_writer"))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/audit?kind=registered&agent_id=a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = json_body(response).await;
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["record"]["kind"], "registered");
    }
}
