//! Debug endpoints for checking the vendor setup without opening a session.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /debug/environment
pub async fn debug_environment(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let vendor = &state.get_config().vendor;

    Ok(HttpResponse::Ok().json(json!({
        "api_key": if vendor.api_key.as_ref().is_some_and(|key| !key.is_blank()) { "set" } else { "not set" },
        "base_url": vendor.base_url,
        "avatar_id": vendor.avatar_id,
        "voice_id": vendor.voice_id,
        "verify_voice": vendor.verify_voice,
        "http_proxy": std::env::var("HTTP_PROXY").unwrap_or_else(|_| "not set".to_string()),
        "https_proxy": std::env::var("HTTPS_PROXY").unwrap_or_else(|_| "not set".to_string()),
        "active_sessions": state.active_sessions()
    })))
}

/// GET /debug/voice - check the configured voice against the vendor voice list.
pub async fn debug_voice(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let voice_id = state.get_config().vendor.voice_id.clone();
    state.conversations.client().verify_voice(&voice_id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "voice_id": voice_id,
        "available": true
    })))
}

/// Configuration for debug routes
pub fn configure_debug_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/debug")
            .route("/environment", web::get().to(debug_environment))
            .route("/voice", web::get().to(debug_voice)),
    );
}
