//! # Conversation WebSocket
//!
//! Live channel for one conversation. Clients connect to
//! `/ws/sessions/{session_id}` after creating the session over REST.
//!
//! ## Protocol:
//! 1. **Connection**: the server immediately sends the current snapshot
//! 2. **Signals**: clients send `{"type":"signal","signal":{...}}`, using the same
//!    tagged signals the REST `/signals` endpoint accepts
//! 3. **Updates**: every state change is pushed as a `snapshot` message
//! 4. **Stalls**: an utterance that stops receiving fragments produces a `stalled` message
//! 5. **Teardown**: closing the socket ends the session; an ended session sends
//!    `ended` and closes the socket
//!
//! ## Message Format:
//! - **Client → Server**: JSON `signal` and `ping` messages
//! - **Server → Client**: JSON `snapshot`, `stalled`, `ended`, `error` and `pong` messages

use crate::conversation::{ConversationService, ConversationSession, ConversationSnapshot, SessionEvent, Signal, Speaker};
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Messages accepted from the browser.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Signal { signal: Signal },
    Ping { timestamp: u64 },
}

/// Messages pushed to the browser.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        session_id: String,
        conversation: ConversationSnapshot,
    },
    Stalled {
        session_id: String,
        speaker: Speaker,
        message: String,
    },
    Ended {
        session_id: String,
        reason: String,
    },
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
    Pong {
        timestamp: u64,
    },
}

impl ServerMessage {
    fn from_event(session_id: &str, event: SessionEvent) -> Self {
        let session_id = session_id.to_string();
        match event {
            SessionEvent::Updated(conversation) => Self::Snapshot { session_id, conversation },
            SessionEvent::Stalled { speaker, message } => Self::Stalled { session_id, speaker, message },
            SessionEvent::Ended { reason } => Self::Ended { session_id, reason },
        }
    }

    fn from_error(session_id: &str, err: &AppError) -> Self {
        Self::Error {
            code: err.kind().to_string(),
            message: err.message(),
            session_id: Some(session_id.to_string()),
        }
    }
}

/// One browser connection bound to one conversation.
pub struct SessionWebSocket {
    session: Arc<ConversationSession>,
    service: ConversationService,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl SessionWebSocket {
    pub fn new(session: Arc<ConversationSession>, state: &AppState) -> Self {
        let performance = &state.get_config().performance;
        Self {
            session,
            service: state.conversations.clone(),
            heartbeat_interval: Duration::from_secs(performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(performance.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    fn session_id(&self) -> &str {
        &self.session.session_id
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize websocket message: {}", e),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Signal { signal }) => {
                debug!("Session {} received {} over websocket", self.session_id(), signal.name());
                // Successful signals come back through the event stream.
                if let Err(e) = self.service.dispatch(&self.session, signal) {
                    let err = AppError::from(e);
                    self.send(ctx, &ServerMessage::from_error(self.session_id(), &err));
                }
            }
            Ok(ClientMessage::Ping { timestamp }) => {
                self.last_heartbeat = Instant::now();
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
            Err(e) => {
                let message = ServerMessage::Error {
                    code: "invalid_json".to_string(),
                    message: format!("Invalid JSON: {}", e),
                    session_id: Some(self.session_id().to_string()),
                };
                self.send(ctx, &message);
            }
        }
    }
}

impl Actor for SessionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connected to session {}", self.session_id());

        self.send(
            ctx,
            &ServerMessage::Snapshot {
                session_id: self.session_id().to_string(),
                conversation: self.session.snapshot(),
            },
        );
        ctx.add_stream(BroadcastStream::new(self.session.subscribe()));

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("WebSocket heartbeat timeout for session {}, closing", act.session_id());
                ctx.stop();
                return;
            }
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            ctx.ping(&timestamp.to_be_bytes());
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket for session {} stopped", self.session_id());

        let service = self.service.clone();
        let session_id = self.session.session_id.clone();
        tokio::spawn(async move {
            service.conclude(&session_id, "websocket closed").await;
        });
    }
}

/// Conversation events from the session's broadcast channel.
impl StreamHandler<Result<SessionEvent, BroadcastStreamRecvError>> for SessionWebSocket {
    fn handle(&mut self, event: Result<SessionEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match event {
            Ok(SessionEvent::Ended { reason }) => {
                let message = ServerMessage::Ended {
                    session_id: self.session_id().to_string(),
                    reason: reason.clone(),
                };
                self.send(ctx, &message);
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some(reason),
                }));
                ctx.stop();
            }
            Ok(event) => {
                let message = ServerMessage::from_event(self.session_id(), event);
                self.send(ctx, &message);
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("WebSocket for session {} lagged by {} events, resyncing", self.session_id(), skipped);
                let message = ServerMessage::Snapshot {
                    session_id: self.session_id().to_string(),
                    conversation: self.session.snapshot(),
                };
                self.send(ctx, &message);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Event stream for session {} closed", self.session_id());
        ctx.stop();
    }
}

/// Frames from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                let message = ServerMessage::Error {
                    code: "unsupported_frame".to_string(),
                    message: "Binary frames are not supported".to_string(),
                    session_id: Some(self.session_id().to_string()),
                };
                self.send(ctx, &message);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/sessions/{session_id}` to a conversation socket.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = state.conversations.session(&path)?;
    info!(
        "WebSocket connection request for session {} from {:?}",
        session.session_id,
        req.connection_info().realip_remote_addr()
    );

    ws::start(SessionWebSocket::new(session, &state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ControllerError;
    use serde_json::json;

    #[test]
    fn test_client_signal_message() {
        let message: ClientMessage = serde_json::from_value(json!({
            "type": "signal",
            "signal": {"type": "user_fragment", "sequence": 3, "text": "hello"}
        }))
        .unwrap();

        match message {
            ClientMessage::Signal { signal: Signal::UserFragment { sequence, text } } => {
                assert_eq!(sequence, 3);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping","timestamp":42}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping { timestamp: 42 }));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"audio_data"}"#).is_err());
    }

    #[test]
    fn test_event_messages() {
        let stalled = ServerMessage::from_event(
            "sess-1",
            SessionEvent::Stalled {
                speaker: Speaker::User,
                message: "No speech received for 5s".to_string(),
            },
        );
        assert_eq!(
            serde_json::to_value(&stalled).unwrap(),
            json!({
                "type": "stalled",
                "session_id": "sess-1",
                "speaker": "user",
                "message": "No speech received for 5s"
            })
        );

        let ended = ServerMessage::from_event("sess-1", SessionEvent::Ended { reason: "ended by user".to_string() });
        assert_eq!(
            serde_json::to_value(&ended).unwrap(),
            json!({"type": "ended", "session_id": "sess-1", "reason": "ended by user"})
        );
    }

    #[test]
    fn test_error_message_uses_error_kind() {
        let err = AppError::from(ControllerError::EmptyResponse);
        let json = serde_json::to_value(ServerMessage::from_error("sess-1", &err)).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], err.kind());
        assert_eq!(json["session_id"], "sess-1");
    }
}
