//! # Conversation Session Management
//!
//! A conversation session binds one remote avatar session to its Turn
//! Controller and transcript. Sessions are registered with the
//! [`SessionManager`] only after the vendor has provisioned them, and removed
//! when they are torn down.
//!
//! ## Session Lifecycle:
//! 1. **Active**: avatar provisioned, conversation in progress
//! 2. **Completing**: conversation finished, teardown scheduled after a grace delay
//! 3. **Ended**: vendor session released
//! 4. **Error**: teardown failed; the vendor will expire the session on its own

use crate::conversation::controller::{ConversationSnapshot, TurnController};
use crate::conversation::error::ControllerError;
use crate::conversation::signal::{Effect, Signal};
use crate::conversation::transcript::{TranscriptEntry, TranscriptRecorder};
use crate::conversation::turn::Speaker;
use crate::vendor::{SessionDescriptor, SessionError, StreamingClient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Buffered updates per session before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Active,
    Completing,
    Ended,
    Error(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completing => "completing",
            SessionStatus::Ended => "ended",
            SessionStatus::Error(_) => "error",
        }
    }
}

/// Pushed to every subscriber of a session (the WebSocket bridge).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Updated(ConversationSnapshot),
    Stalled { speaker: Speaker, message: String },
    Ended { reason: String },
}

/// Ownership of a provisioned vendor session.
///
/// The vendor session is stopped exactly once: by the first call to
/// [`release`](Self::release), or from `Drop` if the lease is lost without
/// being released.
pub struct SessionLease {
    descriptor: SessionDescriptor,
    client: StreamingClient,
    released: AtomicBool,
}

impl SessionLease {
    pub fn new(descriptor: SessionDescriptor, client: StreamingClient) -> Self {
        Self {
            descriptor,
            client,
            released: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stop the vendor session. Returns `Ok(false)` when it was already released.
    pub async fn release(&self, reason: &str) -> Result<bool, SessionError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        info!(session_id = %self.descriptor.session_id, reason, "Releasing avatar session");
        self.client.stop_session(&self.descriptor).await?;
        Ok(true)
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let session_id = self.descriptor.session_id.clone();
        warn!(session_id = %session_id, "Session lease dropped without release");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let descriptor = self.descriptor.clone();
                handle.spawn(async move {
                    if let Err(e) = client.stop_session(&descriptor).await {
                        warn!(session_id = %descriptor.session_id, "Background teardown failed: {}", e);
                    }
                });
            }
            Err(_) => error!(session_id = %session_id, "No runtime available; avatar session left to expire"),
        }
    }
}

/// One live conversation.
///
/// ## Thread Safety:
/// The controller sits behind a single mutex and every signal is applied under
/// it, so conversation state changes are serialized. Vendor calls happen
/// outside the lock.
pub struct ConversationSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    lease: SessionLease,
    controller: Mutex<TurnController>,
    recorder: Mutex<TranscriptRecorder>,
    status: RwLock<SessionStatus>,
    completion_scheduled: AtomicBool,
    /// Held across every vendor listening call, so they reach the vendor one at a time.
    listening: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl ConversationSession {
    pub fn new(lease: SessionLease, controller: TurnController, recorder: TranscriptRecorder) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session_id: lease.descriptor().session_id.clone(),
            created_at: Utc::now(),
            lease,
            controller: Mutex::new(controller),
            recorder: Mutex::new(recorder),
            status: RwLock::new(SessionStatus::Active),
            completion_scheduled: AtomicBool::new(false),
            listening: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        self.lease.descriptor()
    }

    pub fn lease(&self) -> &SessionLease {
        &self.lease
    }

    pub fn status(&self) -> SessionStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Apply a signal and persist any turns it records.
    pub fn apply(&self, signal: Signal, now: Instant) -> Result<Vec<Effect>, ControllerError> {
        let (effects, snapshot) = {
            let mut controller = self.controller.lock().unwrap_or_else(PoisonError::into_inner);
            let effects = controller.apply(signal, now)?;

            let mut recorder = self.recorder.lock().unwrap_or_else(PoisonError::into_inner);
            for effect in &effects {
                if let Effect::RecordTurn(turn) = effect {
                    if let Err(e) = recorder.record(turn.clone()) {
                        error!(session_id = %self.session_id, "Transcript rejected turn {}: {}", turn.index, e);
                    }
                }
            }

            (effects, controller.snapshot())
        };

        if !effects.is_empty() {
            self.publish(SessionEvent::Updated(snapshot));
        }
        Ok(effects)
    }

    /// Surface a failure that happened outside the controller.
    pub fn report(&self, message: impl Into<String>) {
        let snapshot = {
            let mut controller = self.controller.lock().unwrap_or_else(PoisonError::into_inner);
            controller.report_status(message);
            controller.snapshot()
        };
        self.publish(SessionEvent::Updated(snapshot));
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }

    /// Whether the controller currently wants the microphone open.
    pub fn wants_listening(&self) -> bool {
        !self.lease.is_released()
            && self.controller.lock().unwrap_or_else(PoisonError::into_inner).media().mic_active
    }

    pub async fn lock_listening(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.listening.lock().await
    }

    pub fn export(&self) -> Vec<TranscriptEntry> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner).export()
    }

    /// First caller wins; later completions are ignored.
    pub fn schedule_completion(&self) -> bool {
        let first = !self.completion_scheduled.swap(true, Ordering::SeqCst);
        if first {
            self.set_status(SessionStatus::Completing);
        }
        first
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is normal for HTTP-only clients.
        let _ = self.events.send(event);
    }

    /// Release the vendor session and notify subscribers.
    pub async fn end(&self, reason: &str) -> Result<bool, SessionError> {
        let result = self.lease.release(reason).await;
        match &result {
            Ok(_) => self.set_status(SessionStatus::Ended),
            Err(e) => self.set_status(SessionStatus::Error(e.to_string())),
        }
        self.publish(SessionEvent::Ended { reason: reason.to_string() });
        result
    }
}

/// Summary of session manager state.
#[derive(Debug, Serialize)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub status_counts: HashMap<String, usize>,
}

/// Registry of live conversations.
///
/// ## Resource Management:
/// - Enforces the concurrent session limit before anything is provisioned
/// - Hands out sessions by vendor session id
/// - Drains every session on shutdown
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ConversationSession>>>,
    max_concurrent_sessions: usize,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    pub fn has_capacity(&self) -> bool {
        self.active_session_count() < self.max_concurrent_sessions
    }

    /// Register a provisioned session. On refusal the session is handed back
    /// so the caller can release it.
    pub fn insert(&self, session: ConversationSession) -> Result<Arc<ConversationSession>, (String, ConversationSession)> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_concurrent_sessions {
            let message = format!("Maximum concurrent sessions ({}) reached", self.max_concurrent_sessions);
            return Err((message, session));
        }
        if sessions.contains_key(&session.session_id) {
            let message = format!("Session ID '{}' already exists", session.session_id);
            return Err((message, session));
        }

        let session = Arc::new(session);
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ConversationSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<ConversationSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_sessions(&self) -> Vec<Arc<ConversationSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<ConversationSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect()
    }

    pub fn summary(&self) -> SessionManagerSummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);

        let mut status_counts = HashMap::new();
        for session in sessions.values() {
            *status_counts.entry(session.status().as_str().to_string()).or_insert(0) += 1;
        }

        SessionManagerSummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions,
            status_counts,
        }
    }
}
