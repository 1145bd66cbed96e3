use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::SupervisorError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::UnknownAgent(_) => StatusCode::NOT_FOUND,
            SupervisorError::StaleSnapshot { .. } | SupervisorError::InvalidLevel(_) => {
                StatusCode::BAD_REQUEST
            }
            SupervisorError::NotIsolated(_) | SupervisorError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            SupervisorError::CircuitOpenRejected { .. } | SupervisorError::IngressClosed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("API error: {}", err);
        }

        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SupervisorError::UnknownAgent("a".into()), StatusCode::NOT_FOUND),
            (SupervisorError::InvalidLevel(9), StatusCode::BAD_REQUEST),
            (SupervisorError::NotIsolated("a".into()), StatusCode::CONFLICT),
            (
                SupervisorError::EscalationExhausted { agent_id: "a".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }
}
