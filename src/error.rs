//! # Error Handling
//!
//! Service-wide error type and its HTTP rendering.
//!
//! Domain modules raise their own `thiserror` enums (`AuthError`,
//! `SessionError`, `ControllerError`, `TranscriptError`). Handlers return
//! [`AppResult`], and the `From` impls below decide how each domain failure is
//! presented to the browser.
//!
//! ## Rules:
//! - The vendor API key never appears in an error message.
//! - Malformed vendor bodies are logged for diagnostics and replaced by a
//!   generic message in the response.
//! - Rejections from the vendor surface the vendor's own message.

use crate::conversation::{ControllerError, TranscriptError};
use crate::vendor::{AuthError, SessionError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use tracing::error;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: unexpected server-side problems (500)
/// - **ConfigError**: missing or invalid configuration, e.g. no vendor key (500)
/// - **UpstreamRejected**: the vendor answered with an error status (502)
/// - **ServiceUnavailable**: the vendor is unreachable or answered garbage (503)
/// - **TransportStall**: no response detected from the avatar stream (504)
/// - **DeviceAccessDenied**: the browser refused microphone access (403)
/// - **Conflict**: the conversation is not in a state that accepts the request (409)
/// - **BadRequest** / **ValidationError**: the client sent unusable input (400)
/// - **NotFound**: unknown session (404)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    UpstreamRejected { status: u16, message: String },
    ServiceUnavailable(String),
    TransportStall(String),
    DeviceAccessDenied(String),
    Conflict(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::UpstreamRejected { status, message } => {
                write!(f, "Vendor rejected the request ({}): {}", status, message)
            }
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::TransportStall(msg) => write!(f, "Transport stall: {}", msg),
            AppError::DeviceAccessDenied(msg) => write!(f, "Device access denied: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::UpstreamRejected { message, .. } => (StatusCode::BAD_GATEWAY, "upstream_rejected", message.clone()),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.clone()),
            AppError::TransportStall(msg) => (StatusCode::GATEWAY_TIMEOUT, "transport_stall", msg.clone()),
            AppError::DeviceAccessDenied(msg) => (StatusCode::FORBIDDEN, "device_access_denied", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
        }
    }

    /// Machine-readable kind, shared by HTTP bodies and WebSocket error frames.
    pub fn kind(&self) -> &'static str {
        self.parts().1
    }

    pub fn message(&self) -> String {
        self.parts().2
    }
}

/// Renders every error as:
/// ```json
/// {
///   "error": {
///     "type": "upstream_rejected",
///     "message": "Invalid API key",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors come from client input, so they are 400s.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingConfiguration(msg) => AppError::ConfigError(msg),
            AuthError::UpstreamRejected { status, message } => AppError::UpstreamRejected { status, message },
            AuthError::MalformedResponse { body } => {
                error!("Malformed credential response: {}", body);
                AppError::ServiceUnavailable("The avatar service returned an unexpected response".to_string())
            }
            AuthError::Transport(e) => {
                error!("Credential request failed: {}", e);
                AppError::ServiceUnavailable("The avatar service is unreachable".to_string())
            }
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UpstreamRejected { status, message } => AppError::UpstreamRejected { status, message },
            SessionError::MalformedResponse { body } => {
                error!("Malformed session response: {}", body);
                AppError::ServiceUnavailable("The avatar service returned an unexpected response".to_string())
            }
            SessionError::InvalidVoice(voice) => {
                AppError::ConfigError(format!("Voice '{}' is not available to this account", voice))
            }
            SessionError::Credential(auth) => auth.into(),
            SessionError::Transport(e) => {
                error!("Session request failed: {}", e);
                AppError::ServiceUnavailable("The avatar service is unreachable".to_string())
            }
        }
    }
}

impl From<ControllerError> for AppError {
    fn from(err: ControllerError) -> Self {
        let message = err.to_string();
        match err {
            ControllerError::EmptyResponse | ControllerError::UnsupportedSignal { .. } => {
                AppError::ValidationError(message)
            }
            ControllerError::ProtocolViolation { .. } => AppError::BadRequest(message),
            ControllerError::TransportStall { .. } => AppError::TransportStall(message),
            ControllerError::DeviceAccessDenied => AppError::DeviceAccessDenied(message),
            ControllerError::InvalidState { .. } | ControllerError::AvatarSpeaking | ControllerError::NotReady => {
                AppError::Conflict(message)
            }
        }
    }
}

impl From<TranscriptError> for AppError {
    fn from(err: TranscriptError) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use crate::conversation::Speaker;

    #[actix_web::test]
    async fn test_error_body_shape() {
        let err = AppError::UpstreamRejected { status: 401, message: "Invalid API key".to_string() };
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "upstream_rejected");
        assert_eq!(value["error"]["message"], "Invalid API key");
        assert!(value["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_domain_errors_map_to_status_codes() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (AuthError::MissingConfiguration("HEYGEN_API_KEY".into()).into(), StatusCode::INTERNAL_SERVER_ERROR),
            (SessionError::UpstreamRejected { status: 400, message: "bad avatar".into() }.into(), StatusCode::BAD_GATEWAY),
            (ControllerError::AvatarSpeaking.into(), StatusCode::CONFLICT),
            (ControllerError::EmptyResponse.into(), StatusCode::BAD_REQUEST),
            (ControllerError::DeviceAccessDenied.into(), StatusCode::FORBIDDEN),
            (
                ControllerError::TransportStall { speaker: Speaker::User, idle_ms: 15_000 }.into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{}", err);
        }
    }

    #[test]
    fn test_malformed_body_is_not_exposed() {
        let err: AppError = SessionError::MalformedResponse { body: "{\"data\":{\"secret\":1}}".into() }.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.message().contains("secret"));
    }
}
