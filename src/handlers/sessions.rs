//! # Conversation REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /token` - short-lived vendor credential for the browser SDK
//! - `POST /sessions` - provision an avatar and open a conversation
//! - `GET /sessions/{session_id}` - session and conversation snapshot
//! - `POST /sessions/{session_id}/signals` - apply one signal (tagged JSON)
//! - `POST /sessions/{session_id}/begin` - start the scripted questions
//! - `POST /sessions/{session_id}/responses` - submit a typed response
//! - `POST /sessions/{session_id}/microphone` - toggle voice capture
//! - `POST /sessions/{session_id}/interrupt` - cut the avatar off
//! - `DELETE /sessions/{session_id}` - end the session
//! - `GET /sessions/{session_id}/transcript` - transcript download
//! - `POST /sessions/close-all` - stop every vendor session for this key

use crate::conversation::transcript::{export_filename, render_export};
use crate::conversation::{ConversationMode, ConversationSession, ConversationSnapshot, OpenConversation, Signal};
use crate::error::AppError;
use crate::state::AppState;
use crate::vendor::AvatarOverrides;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default = "default_mode")]
    pub mode: ConversationMode,
    /// Scripted prompts; falls back to the configured list.
    pub prompts: Option<Vec<String>>,
    pub introduction: Option<String>,
    /// Free-form persona and rules for the avatar's language model.
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub avatar: AvatarOverrides,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_mode() -> ConversationMode {
    ConversationMode::Scripted
}

fn default_auto_start() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SubmitResponseRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub stream_endpoint: String,
    pub room_token: Option<String>,
    /// Short-lived vendor credential; only returned when the session is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub conversation: ConversationSnapshot,
}

impl SessionResponse {
    fn from_session(session: &ConversationSession, conversation: ConversationSnapshot) -> Self {
        let descriptor = session.descriptor();
        Self {
            session_id: session.session_id.clone(),
            status: session.status().as_str().to_string(),
            created_at: session.created_at,
            stream_endpoint: descriptor.stream_endpoint.clone(),
            room_token: descriptor.room_token.clone(),
            session_token: None,
            conversation,
        }
    }
}

pub async fn issue_token(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let credential = state.conversations.client().fetch_credential().await?;
    info!("Issued credential {}", credential.preview());
    Ok(HttpResponse::Ok().json(json!({ "token": credential.as_str() })))
}

pub async fn create_session(
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    let session = state
        .conversations
        .open(OpenConversation {
            mode: request.mode,
            prompts: request.prompts,
            introduction: request.introduction,
            knowledge_base: request.knowledge_base,
            avatar: request.avatar,
            auto_start: request.auto_start,
        })
        .await?;

    let mut response = SessionResponse::from_session(&session, session.snapshot());
    response.session_token = Some(session.descriptor().credential.as_str().to_string());
    Ok(HttpResponse::Created().json(response))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session = state.conversations.session(&path)?;
    Ok(HttpResponse::Ok().json(SessionResponse::from_session(&session, session.snapshot())))
}

pub async fn apply_signal(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<Signal>,
) -> Result<HttpResponse, AppError> {
    dispatch(&state, &path, body.into_inner())
}

pub async fn begin(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    dispatch(&state, &path, Signal::Begin)
}

pub async fn submit_response(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SubmitResponseRequest>,
) -> Result<HttpResponse, AppError> {
    dispatch(&state, &path, Signal::SubmitResponse { text: body.into_inner().text })
}

pub async fn toggle_microphone(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    dispatch(&state, &path, Signal::ToggleMicrophone)
}

pub async fn interrupt(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    state.conversations.interrupt(&path).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "interrupted",
        "session_id": path.into_inner()
    })))
}

pub async fn end_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let conversation = state.conversations.end(&session_id, "ended by user").await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "ended",
        "session_id": session_id,
        "conversation": conversation
    })))
}

pub async fn download_transcript(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let entries = state.conversations.transcript(&path)?;
    let body = render_export(&entries).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(export_filename(Utc::now().date_naive()))],
        })
        .body(body))
}

pub async fn close_all_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let report = state.conversations.close_all().await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": format!(
            "Closed {} sessions, {} failed",
            report.closed_sessions, report.failed_sessions
        ),
        "closed_sessions": report.closed_sessions,
        "failed_sessions": report.failed_sessions,
        "details": report.details
    })))
}

fn dispatch(state: &AppState, session_id: &str, signal: Signal) -> Result<HttpResponse, AppError> {
    let session = state.conversations.session(session_id)?;
    let conversation = state.conversations.dispatch(&session, signal)?;
    Ok(HttpResponse::Ok().json(SessionResponse::from_session(&session, conversation)))
}

pub fn configure_session_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/token", web::post().to(issue_token)).service(
        web::scope("/sessions")
            .route("", web::post().to(create_session))
            .route("/close-all", web::post().to(close_all_sessions))
            .route("/{session_id}", web::get().to(get_session))
            .route("/{session_id}", web::delete().to(end_session))
            .route("/{session_id}/signals", web::post().to(apply_signal))
            .route("/{session_id}/begin", web::post().to(begin))
            .route("/{session_id}/responses", web::post().to(submit_response))
            .route("/{session_id}/microphone", web::post().to(toggle_microphone))
            .route("/{session_id}/interrupt", web::post().to(interrupt))
            .route("/{session_id}/transcript", web::get().to(download_transcript)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKey, AppConfig};
    use actix_web::{http::StatusCode, test, App};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn vendor() -> MockServer {
        let vendor = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/streaming.create_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"token": "tok-123456789"}})))
            .mount(&vendor)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/streaming.new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"session_id": "sess-1", "url": "wss://media.example", "access_token": "room-1"}
            })))
            .mount(&vendor)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/streaming.task"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&vendor)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/streaming.stop"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&vendor)
            .await;
        vendor
    }

    fn state(vendor: &MockServer) -> AppState {
        let mut config = AppConfig::default();
        config.vendor.base_url = vendor.uri();
        config.vendor.api_key = Some(ApiKey::new("secret-key"));
        config.vendor.avatar_id = "avatar-1".to_string();
        AppState::new(config).unwrap()
    }

    #[actix_web::test]
    async fn test_scripted_session_over_http() {
        let vendor = vendor().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(&vendor)))
                .configure(configure_session_routes),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/sessions")
            .set_json(json!({"mode": "scripted", "prompts": ["What do you build?", "Who pays?"]}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(created["session_id"], "sess-1");
        assert_eq!(created["session_token"], "tok-123456789");
        assert_eq!(created["conversation"]["state"], "introducing");

        let request = test::TestRequest::post().uri("/sessions/sess-1/responses").set_json(json!({"text": "x"})).to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::CONFLICT);

        let request = test::TestRequest::post().uri("/sessions/sess-1/begin").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["conversation"]["current_turn"], 0);
        assert!(body.get("session_token").is_none());

        let request = test::TestRequest::post().uri("/sessions/sess-1/responses").set_json(json!({"text": "  "})).to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::BAD_REQUEST);

        let request = test::TestRequest::post()
            .uri("/sessions/sess-1/signals")
            .set_json(json!({"type": "submit_response", "text": "Robots"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["conversation"]["current_turn"], 1);

        let request = test::TestRequest::delete().uri("/sessions/sess-1").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::OK);
        let request = test::TestRequest::delete().uri("/sessions/sess-1").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::NOT_FOUND);

        let request = test::TestRequest::get().uri("/sessions/sess-1/transcript").to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get("content-disposition")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains("interview_transcript_"));

        let entries: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(entries, json!([{"id": 1, "question": "What do you build?", "answer": "Robots"}]));
    }

    #[actix_web::test]
    async fn test_unknown_session_and_token() {
        let vendor = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/streaming.create_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-abc"})))
            .mount(&vendor)
            .await;

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(&vendor)))
                .configure(configure_session_routes),
        )
        .await;

        let request = test::TestRequest::get().uri("/sessions/missing").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::NOT_FOUND);

        let request = test::TestRequest::post().uri("/token").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body, json!({"token": "tok-abc"}));
    }
}
