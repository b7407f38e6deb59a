//! # Conversation Module
//!
//! Turn-taking between a user and a streamed avatar.
//!
//! ## Key Components:
//! - **controller**: the Turn Controller state machine (scripted and free-form modes)
//! - **utterance**: assembly of streamed speech fragments
//! - **transcript**: append-only record of answered turns and its export
//! - **session**: one live conversation, its vendor lease, and the session registry
//! - **service**: opening conversations and executing controller effects
//!
//! ## Flow:
//! ```text
//! HTTP / WebSocket ──Signal──▶ TurnController ──Effect──▶ ConversationService ──▶ vendor
//!        ▲                                                        │
//!        └──────────────── follow-up Signal ◀─────────────────────┘
//! ```

pub mod controller;
pub mod error;
pub mod service;
pub mod session;
pub mod signal;
pub mod transcript;
pub mod turn;
pub mod utterance;

pub use controller::{ConversationMode, ConversationSnapshot, ConversationState, TurnController};
pub use error::{ControllerError, TranscriptError};
pub use service::{ConversationService, OpenConversation};
pub use session::{ConversationSession, SessionEvent, SessionManager};
pub use signal::{Effect, Signal};
pub use transcript::{InMemoryTranscriptRepository, TranscriptEntry, TranscriptRepository};
pub use turn::{Speaker, Turn};
