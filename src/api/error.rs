use crate::services::ingress::{ErrorKind, IngressError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Gateway Timeout: {0}")]
    GatewayTimeout(String),

    #[error("Client Closed Request")]
    ClientClosed,
}

impl From<IngressError> for AppError {
    fn from(err: IngressError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Input => AppError::BadRequest(message),
            ErrorKind::NotFound => AppError::NotFound(message),
            ErrorKind::Storage | ErrorKind::Broker | ErrorKind::Integrity => {
                AppError::Internal(message)
            }
            ErrorKind::Timeout => AppError::GatewayTimeout(message),
            ErrorKind::Cancelled => AppError::ClientClosed,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            AppError::GatewayTimeout(msg) => {
                tracing::warn!("Upstream timeout: {}", msg);
                (StatusCode::GATEWAY_TIMEOUT, msg)
            }
            AppError::ClientClosed => (
                // nginx's "client closed request"
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "Client closed request".to_string(),
            ),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
