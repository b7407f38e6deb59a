use crate::conversation::turn::Speaker;
use thiserror::Error;

/// Reasons the Turn Controller refuses a signal. A refused signal never
/// changes the conversation state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    #[error("Cannot {action} while the conversation is {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("The avatar is speaking; wait for it to finish")]
    AvatarSpeaking,

    #[error("Response is empty")]
    EmptyResponse,

    #[error("{speaker} fragment out of order: expected #{expected}, received #{received}")]
    ProtocolViolation { speaker: Speaker, expected: u64, received: u64 },

    #[error("No response detected from the {speaker} after {idle_ms}ms")]
    TransportStall { speaker: Speaker, idle_ms: u64 },

    #[error("Microphone access was denied. Allow microphone access in the browser and reload, or type your answers instead")]
    DeviceAccessDenied,

    #[error("Voice chat is not ready yet")]
    NotReady,

    #[error("'{signal}' is not available in {mode} mode")]
    UnsupportedSignal { signal: &'static str, mode: &'static str },
}

/// Failures of the transcript store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranscriptError {
    #[error("Turn {received} recorded out of order (next index is {expected})")]
    OutOfOrder { expected: usize, received: usize },

    #[error("Turn {0} has no response to record")]
    Unanswered(usize),
}
