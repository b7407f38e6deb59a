//! # Conversation Service
//!
//! Opens conversations against the vendor and carries out the effects the
//! Turn Controller emits. Vendor calls run as spawned tasks outside the
//! controller lock; their outcome re-enters the controller as a signal.
//!
//! ## Opening a conversation:
//! 1. Check the session limit (nothing is provisioned when full)
//! 2. Mint a short-lived credential
//! 3. Optionally verify the configured voice
//! 4. Provision the avatar session and wrap it in a [`SessionLease`]
//! 5. Register the session and, unless told otherwise, start the conversation

use crate::config::{AppConfig, ConversationConfig, VendorConfig};
use crate::conversation::controller::{
    ControllerSettings, ConversationMode, ConversationSnapshot, PromptSource, TurnController,
};
use crate::conversation::error::ControllerError;
use crate::conversation::session::{ConversationSession, SessionEvent, SessionLease, SessionManager};
use crate::conversation::signal::{Effect, Signal};
use crate::conversation::transcript::{TranscriptEntry, TranscriptRecorder, TranscriptRepository};
use crate::error::{AppError, AppResult};
use crate::vendor::{retry_with_delay, AvatarConfig, AvatarOverrides, CloseAllReport, StreamingClient, TaskType};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Parameters for a new conversation.
#[derive(Debug, Clone)]
pub struct OpenConversation {
    pub mode: ConversationMode,
    pub prompts: Option<Vec<String>>,
    pub introduction: Option<String>,
    /// Free-form persona override; the configured knowledge base otherwise.
    pub knowledge_base: Option<String>,
    pub avatar: AvatarOverrides,
    pub auto_start: bool,
}

#[derive(Clone)]
pub struct ConversationService {
    client: StreamingClient,
    sessions: Arc<SessionManager>,
    transcripts: Arc<dyn TranscriptRepository>,
    vendor: Arc<VendorConfig>,
    conversation: Arc<ConversationConfig>,
}

impl ConversationService {
    pub fn new(
        config: &AppConfig,
        client: StreamingClient,
        sessions: Arc<SessionManager>,
        transcripts: Arc<dyn TranscriptRepository>,
    ) -> Self {
        Self {
            client,
            sessions,
            transcripts,
            vendor: Arc::new(config.vendor.clone()),
            conversation: Arc::new(config.conversation.clone()),
        }
    }

    pub fn client(&self) -> &StreamingClient {
        &self.client
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn session(&self, session_id: &str) -> AppResult<Arc<ConversationSession>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))
    }

    pub async fn open(&self, request: OpenConversation) -> AppResult<Arc<ConversationSession>> {
        if !self.sessions.has_capacity() {
            return Err(AppError::Conflict(format!(
                "Maximum concurrent sessions ({}) reached",
                self.sessions.max_sessions()
            )));
        }

        let source = self.prompt_source(&request);
        let mut avatar = AvatarConfig::from_vendor(&self.vendor).with_overrides(&request.avatar);
        avatar.knowledge_base = self.knowledge_base(&request);
        if avatar.avatar_id.trim().is_empty() {
            return Err(AppError::ValidationError("An avatar_id must be configured or provided".to_string()));
        }

        let credential = self.client.fetch_credential().await?;
        if self.vendor.verify_voice {
            self.client.verify_voice(&avatar.voice_id).await?;
        }
        let descriptor = self.client.start_session(&credential, &avatar).await?;

        let mut settings = ControllerSettings::from_config(&self.conversation);
        if let Some(introduction) = request.introduction.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
            settings.introduction = Some(introduction.to_string());
        }

        let recorder = TranscriptRecorder::open(descriptor.session_id.clone(), self.transcripts.clone());
        let lease = SessionLease::new(descriptor, self.client.clone());
        let session = ConversationSession::new(lease, TurnController::new(source, settings), recorder);

        let session = match self.sessions.insert(session) {
            Ok(session) => session,
            Err((message, rejected)) => {
                if let Err(e) = rejected.end("session limit reached").await {
                    warn!(session_id = %rejected.session_id, "Failed to release rejected session: {}", e);
                }
                return Err(AppError::Conflict(message));
            }
        };

        info!(
            session_id = %session.session_id,
            mode = request.mode.as_str(),
            "Conversation opened"
        );

        if request.auto_start {
            self.dispatch(&session, Signal::Start)?;
        }
        Ok(session)
    }

    /// Apply a signal to a session and run the resulting effects.
    pub fn dispatch(
        &self,
        session: &Arc<ConversationSession>,
        signal: Signal,
    ) -> Result<ConversationSnapshot, ControllerError> {
        let name = signal.name();
        let effects = session.apply(signal, Instant::now()).map_err(|e| {
            debug!(session_id = %session.session_id, signal = name, "Signal rejected: {}", e);
            e
        })?;
        self.execute(session, effects);
        Ok(session.snapshot())
    }

    /// End a session: remove it and release the vendor session.
    pub async fn end(&self, session_id: &str, reason: &str) -> AppResult<ConversationSnapshot> {
        let session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

        let snapshot = session.snapshot();
        session.end(reason).await?;
        info!(session_id, reason, "Conversation ended");
        Ok(snapshot)
    }

    /// End a session from a background path. A session that is already gone is
    /// fine; a failed vendor teardown is logged and returned.
    pub async fn conclude(&self, session_id: &str, reason: &str) -> Option<AppError> {
        match self.end(session_id, reason).await {
            Ok(_) => None,
            Err(AppError::NotFound(_)) => {
                debug!(session_id, reason, "Session already ended");
                None
            }
            Err(e) => {
                warn!(session_id, reason, "Teardown failed: {}", e);
                Some(e)
            }
        }
    }

    pub async fn interrupt(&self, session_id: &str) -> AppResult<()> {
        let session = self.session(session_id)?;
        self.client.interrupt(session.descriptor()).await?;
        Ok(())
    }

    /// Transcript of a live session, or of one already torn down.
    pub fn transcript(&self, session_id: &str) -> AppResult<Vec<TranscriptEntry>> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session.export());
        }
        self.transcripts
            .load(session_id)
            .map(|transcript| transcript.export())
            .ok_or_else(|| AppError::NotFound(format!("No transcript for session '{}'", session_id)))
    }

    /// Release every live session. Returns how many were released.
    pub async fn release_all(&self, reason: &str) -> usize {
        let sessions = self.sessions.drain();
        let results = join_all(sessions.iter().map(|session| session.end(reason))).await;

        let mut released = 0;
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(_) => released += 1,
                Err(e) => warn!(session_id = %session.session_id, "Teardown failed: {}", e),
            }
        }
        released
    }

    /// Stop local sessions, then every other vendor session the key can see.
    pub async fn close_all(&self) -> AppResult<CloseAllReport> {
        let local = self.release_all("close all sessions").await;
        let mut report = self.client.close_all_sessions().await?;
        report.closed_sessions += local;
        Ok(report)
    }

    /// Periodically tick every session so stalled utterances get reported.
    pub async fn watch_stalls(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            for session in self.sessions.active_sessions() {
                if let Err(e) = self.dispatch(&session, Signal::Tick) {
                    debug!(session_id = %session.session_id, "Tick rejected: {}", e);
                }
            }
        }
    }

    fn prompt_source(&self, request: &OpenConversation) -> PromptSource {
        match request.mode {
            ConversationMode::Scripted => {
                let prompts = request
                    .prompts
                    .clone()
                    .unwrap_or_else(|| self.conversation.prompts.clone())
                    .into_iter()
                    .map(|prompt| prompt.trim().to_string())
                    .filter(|prompt| !prompt.is_empty())
                    .collect();
                PromptSource::Scripted { prompts }
            }
            ConversationMode::FreeForm => PromptSource::FreeForm {
                termination_phrase: self.conversation.termination_phrase.clone(),
            },
        }
    }

    /// Persona for the avatar's language model. Free-form completion depends on
    /// the avatar saying the termination phrase, so it is always instructed to.
    fn knowledge_base(&self, request: &OpenConversation) -> Option<String> {
        if request.mode != ConversationMode::FreeForm {
            return None;
        }

        let mut knowledge_base = request
            .knowledge_base
            .as_deref()
            .map(str::trim)
            .filter(|kb| !kb.is_empty())
            .unwrap_or_else(|| self.conversation.knowledge_base.trim())
            .to_string();

        let phrase = self.conversation.termination_phrase.trim();
        if !phrase.is_empty() && !knowledge_base.to_lowercase().contains(&phrase.to_lowercase()) {
            if !knowledge_base.is_empty() {
                knowledge_base.push_str("\n\n");
            }
            knowledge_base.push_str(&format!(
                "When you have asked all your questions, end the session by saying: \"{}\"",
                phrase
            ));
        }

        (!knowledge_base.is_empty()).then_some(knowledge_base)
    }

    fn execute(&self, session: &Arc<ConversationSession>, effects: Vec<Effect>) {
        if session.lease().is_released() {
            return;
        }

        for effect in effects {
            match effect {
                Effect::Status(_) | Effect::RecordTurn(_) => {}
                Effect::StartVoiceChat => self.start_voice_chat(session.clone()),
                Effect::StartListening => self.start_listening(session.clone()),
                Effect::StopListening => self.stop_listening(session.clone()),
                Effect::Speak { text, task, fallback } => self.speak(session.clone(), text, task, fallback),
                Effect::Stalled { speaker, idle } => {
                    let message = ControllerError::TransportStall {
                        speaker,
                        idle_ms: idle.as_millis() as u64,
                    }
                    .to_string();
                    warn!(session_id = %session.session_id, %speaker, "{}", message);
                    session.publish(SessionEvent::Stalled { speaker, message });
                }
                Effect::Completed => self.finish(session.clone()),
                Effect::Teardown => {
                    let service = self.clone();
                    let session_id = session.session_id.clone();
                    tokio::spawn(async move {
                        service.conclude(&session_id, "teardown requested").await;
                    });
                }
            }
        }
    }

    fn start_voice_chat(&self, session: Arc<ConversationSession>) {
        let service = self.clone();
        tokio::spawn(async move {
            let config = &service.conversation;
            // The media stream needs a moment before the vendor accepts voice chat.
            tokio::time::sleep(Duration::from_millis(config.stream_stabilization_ms)).await;
            if session.lease().is_released() {
                debug!(session_id = %session.session_id, "Session ended before voice chat could start");
                return;
            }

            let client = &service.client;
            let descriptor = session.descriptor();
            let result = retry_with_delay(
                "start voice chat",
                config.voice_chat_start_attempts,
                Duration::from_millis(config.voice_chat_retry_delay_ms),
                move || client.start_voice_chat(descriptor),
            )
            .await;

            let signal = match result {
                Ok(()) => Signal::VoiceChatStarted,
                Err(e) => {
                    error!(session_id = %session.session_id, "Voice chat failed to start: {}", e);
                    Signal::VoiceChatFailed { reason: e.to_string() }
                }
            };
            service.redispatch(&session, signal);
        });
    }

    /// Open the vendor microphone. The controller's gate is re-read before every
    /// attempt and after success, so a mute that lands mid-retry wins.
    fn start_listening(&self, session: Arc<ConversationSession>) {
        let service = self.clone();
        tokio::spawn(async move {
            let _serial = session.lock_listening().await;
            let config = &service.conversation;
            let client = &service.client;
            let gate = &session;
            let result = retry_with_delay(
                "start listening",
                config.listening_start_attempts,
                Duration::from_millis(config.listening_retry_delay_ms),
                move || async move {
                    if !gate.wants_listening() {
                        return Ok(false);
                    }
                    client.start_listening(gate.descriptor()).await.map(|()| true)
                },
            )
            .await;

            match result {
                Ok(true) if !session.wants_listening() => {
                    debug!(session_id = %session.session_id, "Microphone muted while starting, closing it again");
                    if let Err(e) = client.stop_listening(session.descriptor()).await {
                        warn!(session_id = %session.session_id, "Failed to stop listening: {}", e);
                    }
                }
                Ok(true) => {}
                Ok(false) => debug!(session_id = %session.session_id, "Microphone muted before listening started"),
                Err(e) => {
                    error!(session_id = %session.session_id, "Microphone failed to start: {}", e);
                    service.redispatch(&session, Signal::MicrophoneFailed { reason: e.to_string() });
                }
            }
        });
    }

    fn stop_listening(&self, session: Arc<ConversationSession>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let _serial = session.lock_listening().await;
            // Re-enabled since the mute was requested; the pending start owns it now.
            if session.wants_listening() {
                return;
            }
            if let Err(e) = client.stop_listening(session.descriptor()).await {
                warn!(session_id = %session.session_id, "Failed to stop listening: {}", e);
            }
        });
    }

    fn speak(&self, session: Arc<ConversationSession>, text: String, task: TaskType, fallback: Option<String>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let descriptor = session.descriptor();
            let Err(e) = client.speak(descriptor, &text, task).await else {
                return;
            };
            warn!(session_id = %session.session_id, "Avatar speak task failed: {}", e);

            let outcome = match fallback {
                Some(fallback) => client.speak(descriptor, &fallback, TaskType::Repeat).await,
                None => Err(e),
            };
            if let Err(e) = outcome {
                error!(session_id = %session.session_id, "Avatar could not speak: {}", e);
                session.report(format!("Avatar could not speak: {}", e));
            }
        });
    }

    /// Tear the session down once the closing line has had time to play.
    fn finish(&self, session: Arc<ConversationSession>) {
        if !session.schedule_completion() {
            return;
        }

        let service = self.clone();
        let grace = Duration::from_millis(self.conversation.completion_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            service.conclude(&session.session_id, "conversation complete").await;
        });
    }

    fn redispatch(&self, session: &Arc<ConversationSession>, signal: Signal) {
        let name = signal.name();
        if let Err(e) = self.dispatch(session, signal) {
            warn!(session_id = %session.session_id, signal = name, "Follow-up signal rejected: {}", e);
        }
    }
}
