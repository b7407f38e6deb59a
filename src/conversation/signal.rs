use crate::conversation::turn::{Speaker, Turn};
use crate::vendor::TaskType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Inputs to the Turn Controller: user commands and avatar/media events.
///
/// Serialized as `{"type": "..."}` so the same shape travels over HTTP and the
/// session WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Start,
    Begin,
    SubmitResponse { text: String },

    StreamReady,
    VoiceChatStarted,
    VoiceChatFailed { reason: String },
    StreamDisconnected,

    AvatarStartTalking,
    AvatarStopTalking,
    AvatarFragment { sequence: u64, text: String },
    AvatarUtteranceEnd,

    UserStartTalking,
    UserStopTalking,
    UserFragment { sequence: u64, text: String },
    UserUtteranceEnd,
    UserSilence,

    ToggleMicrophone,
    MicrophoneFailed { reason: String },
    MicrophoneAccess { granted: bool },

    EndSession,
    Tick,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Start => "start",
            Signal::Begin => "begin",
            Signal::SubmitResponse { .. } => "submit_response",
            Signal::StreamReady => "stream_ready",
            Signal::VoiceChatStarted => "voice_chat_started",
            Signal::VoiceChatFailed { .. } => "voice_chat_failed",
            Signal::StreamDisconnected => "stream_disconnected",
            Signal::AvatarStartTalking => "avatar_start_talking",
            Signal::AvatarStopTalking => "avatar_stop_talking",
            Signal::AvatarFragment { .. } => "avatar_fragment",
            Signal::AvatarUtteranceEnd => "avatar_utterance_end",
            Signal::UserStartTalking => "user_start_talking",
            Signal::UserStopTalking => "user_stop_talking",
            Signal::UserFragment { .. } => "user_fragment",
            Signal::UserUtteranceEnd => "user_utterance_end",
            Signal::UserSilence => "user_silence",
            Signal::ToggleMicrophone => "toggle_microphone",
            Signal::MicrophoneFailed { .. } => "microphone_failed",
            Signal::MicrophoneAccess { .. } => "microphone_access",
            Signal::EndSession => "end_session",
            Signal::Tick => "tick",
        }
    }
}

/// Work the controller asks its host to perform. Network effects report back
/// by applying another [`Signal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartVoiceChat,
    StartListening,
    StopListening,
    /// Have the avatar say `text`; on failure retry once with `fallback` as a
    /// plain repeat task.
    Speak {
        text: String,
        task: TaskType,
        fallback: Option<String>,
    },
    RecordTurn(Turn),
    Status(String),
    Stalled { speaker: Speaker, idle: Duration },
    Completed,
    Teardown,
}
