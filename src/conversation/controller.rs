//! The Turn Controller.
//!
//! A single state machine drives both conversation modes. Every user command
//! and avatar/media event arrives as a [`Signal`]; [`TurnController::apply`]
//! updates the state and returns the [`Effect`]s the host must carry out.
//! The controller performs no I/O and reads no clock other than the `now` it
//! is handed, so the whole conversation can be replayed in tests.

use crate::config::ConversationConfig;
use crate::conversation::error::ControllerError;
use crate::conversation::signal::{Effect, Signal};
use crate::conversation::turn::{Speaker, Turn};
use crate::conversation::utterance::UtteranceBuffer;
use crate::vendor::TaskType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    Scripted,
    FreeForm,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Scripted => "scripted",
            ConversationMode::FreeForm => "free_form",
        }
    }
}

/// Where prompts come from.
#[derive(Debug, Clone)]
pub enum PromptSource {
    /// A fixed, ordered list of questions spoken by the avatar.
    Scripted { prompts: Vec<String> },
    /// The remote avatar improvises; each of its utterances is a prompt and
    /// the conversation ends once it says the termination phrase.
    FreeForm { termination_phrase: String },
}

/// What follows an accepted response.
#[derive(Debug, Clone, PartialEq)]
enum Advance {
    Prompt(String),
    Completed,
    AwaitAvatar,
}

impl PromptSource {
    pub fn mode(&self) -> ConversationMode {
        match self {
            PromptSource::Scripted { .. } => ConversationMode::Scripted,
            PromptSource::FreeForm { .. } => ConversationMode::FreeForm,
        }
    }

    fn advance(&self, next_index: usize) -> Advance {
        match self {
            PromptSource::Scripted { prompts } => match prompts.get(next_index) {
                Some(prompt) => Advance::Prompt(prompt.clone()),
                None => Advance::Completed,
            },
            PromptSource::FreeForm { .. } => Advance::AwaitAvatar,
        }
    }

    fn concludes(&self, utterance: &str) -> bool {
        match self {
            PromptSource::Scripted { .. } => false,
            PromptSource::FreeForm { termination_phrase } => utterance
                .to_lowercase()
                .contains(&termination_phrase.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Introducing,
    AwaitingResponse(usize),
    Completed,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Introducing => "introducing",
            ConversationState::AwaitingResponse(_) => "awaiting_response",
            ConversationState::Completed => "completed",
        }
    }

    pub fn current_turn(&self) -> Option<usize> {
        match self {
            ConversationState::AwaitingResponse(index) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Texts and timings the controller needs beyond its prompt source.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub introduction: Option<String>,
    pub opening_message: String,
    pub fallback_introduction: Option<String>,
    pub utterance_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &ConversationConfig) -> Self {
        let non_blank = |text: &str| {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        };

        Self {
            introduction: non_blank(&config.introduction),
            opening_message: config.opening_message.trim().to_string(),
            fallback_introduction: non_blank(&config.fallback_introduction),
            utterance_timeout: config.utterance_timeout(),
        }
    }
}

/// Media and microphone flags mirrored from the avatar stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaFlags {
    pub stream_ready: bool,
    pub voice_chat_started: bool,
    pub avatar_speaking: bool,
    pub user_talking: bool,
    pub mic_active: bool,
    pub voice_disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Captions {
    pub avatar: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub questions_asked: usize,
    pub responses_recorded: usize,
    pub duration_secs: i64,
}

/// Read-only view handed to HTTP and WebSocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub mode: ConversationMode,
    pub state: &'static str,
    pub current_turn: Option<usize>,
    pub capturing_response: bool,
    pub introduction: Option<String>,
    pub turns: Vec<Turn>,
    pub media: MediaFlags,
    pub captions: Captions,
    pub stalled: Vec<Speaker>,
    pub status: String,
    pub closing_remark: Option<String>,
    pub stats: ConversationStats,
}

#[derive(Debug)]
pub struct TurnController {
    source: PromptSource,
    settings: ControllerSettings,
    state: ConversationState,
    turns: Vec<Turn>,
    introduction: Option<String>,
    avatar: UtteranceBuffer,
    user: UtteranceBuffer,
    media: MediaFlags,
    voice_chat_pending: bool,
    opening_requested: bool,
    closing_remark: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
}

impl TurnController {
    pub fn new(source: PromptSource, settings: ControllerSettings) -> Self {
        Self {
            source,
            settings,
            state: ConversationState::Idle,
            turns: Vec::new(),
            introduction: None,
            avatar: UtteranceBuffer::new(Speaker::Avatar),
            user: UtteranceBuffer::new(Speaker::User),
            media: MediaFlags::default(),
            voice_chat_pending: false,
            opening_requested: false,
            closing_remark: None,
            status: "Ready".to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn mode(&self) -> ConversationMode {
        self.source.mode()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn media(&self) -> MediaFlags {
        self.media
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_completed(&self) -> bool {
        self.state == ConversationState::Completed
    }

    /// Replace the user-visible status without a transition.
    pub fn report_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
    }

    pub fn capturing_response(&self) -> bool {
        matches!(self.state, ConversationState::AwaitingResponse(_)) && !self.media.avatar_speaking
    }

    /// Apply one signal. On `Err` nothing observable has changed.
    pub fn apply(&mut self, signal: Signal, now: Instant) -> Result<Vec<Effect>, ControllerError> {
        let mut effects = Vec::new();

        match signal {
            Signal::Start => self.start(&mut effects)?,
            Signal::Begin => self.begin(&mut effects)?,
            Signal::SubmitResponse { text } => self.accept_response(&text, &mut effects)?,

            Signal::StreamReady => {
                self.media.stream_ready = true;
                let wants_voice = self.mode() == ConversationMode::FreeForm
                    && !self.media.voice_chat_started
                    && !self.voice_chat_pending
                    && !self.is_completed();
                if wants_voice {
                    self.voice_chat_pending = true;
                    effects.push(Effect::StartVoiceChat);
                    self.set_status("Stream ready, starting voice chat", &mut effects);
                } else {
                    self.set_status("Stream ready", &mut effects);
                }
            }
            Signal::VoiceChatStarted => {
                self.voice_chat_pending = false;
                self.media.voice_chat_started = true;
                self.media.mic_active = false;
                self.set_status("Voice chat ready", &mut effects);
                self.request_opening(&mut effects);
            }
            Signal::VoiceChatFailed { reason } => {
                self.voice_chat_pending = false;
                self.media.voice_chat_started = false;
                self.set_status(format!("Voice chat error: {}", reason), &mut effects);
            }
            Signal::StreamDisconnected => {
                self.media = MediaFlags {
                    voice_disabled: self.media.voice_disabled,
                    ..MediaFlags::default()
                };
                self.voice_chat_pending = false;
                self.avatar.reset();
                self.user.reset();
                self.set_status("Stream disconnected", &mut effects);
                effects.push(Effect::Teardown);
            }

            Signal::AvatarStartTalking => {
                self.mute(&mut effects);
                self.media.avatar_speaking = true;
                self.set_status("Avatar is speaking", &mut effects);
            }
            Signal::AvatarStopTalking => {
                self.media.avatar_speaking = false;
                // The vendor SDK may unmute on its own once the avatar stops.
                if self.mode() == ConversationMode::FreeForm && self.media.voice_chat_started {
                    self.media.mic_active = false;
                    effects.push(Effect::StopListening);
                }
                if self.capturing_response() {
                    self.set_status("Your turn to answer", &mut effects);
                }
            }
            Signal::AvatarFragment { sequence, text } => {
                self.require_free_form("avatar_fragment")?;
                self.avatar.push(sequence, &text, now)?;
            }
            Signal::AvatarUtteranceEnd => {
                self.require_free_form("avatar_utterance_end")?;
                if let Some(text) = self.avatar.flush() {
                    self.on_avatar_utterance(text, &mut effects);
                }
            }

            Signal::UserStartTalking => {
                self.media.user_talking = true;
                self.set_status("Listening...", &mut effects);
            }
            Signal::UserStopTalking => {
                self.media.user_talking = false;
                self.set_status("Processing your response", &mut effects);
            }
            Signal::UserFragment { sequence, text } => {
                self.require_free_form("user_fragment")?;
                if self.media.avatar_speaking {
                    return Err(ControllerError::AvatarSpeaking);
                }
                self.user.push(sequence, &text, now)?;
            }
            Signal::UserUtteranceEnd => {
                self.require_free_form("user_utterance_end")?;
                self.media.user_talking = false;
                if self.capturing_response() {
                    if let Some(text) = self.user.flush() {
                        self.accept_response(&text, &mut effects)?;
                    }
                } else if self.user.is_open() {
                    self.user.reset();
                    self.set_status("Speech ignored outside of a question", &mut effects);
                }
            }
            Signal::UserSilence => {
                if self.media.mic_active {
                    self.mute(&mut effects);
                    self.set_status("No speech detected, microphone off", &mut effects);
                }
            }

            Signal::ToggleMicrophone => self.toggle_microphone(&mut effects)?,
            Signal::MicrophoneFailed { reason } => {
                self.media.mic_active = false;
                self.set_status(format!("Microphone error: {}", reason), &mut effects);
            }
            Signal::MicrophoneAccess { granted } => {
                self.media.voice_disabled = !granted;
                if granted {
                    self.set_status("Microphone available", &mut effects);
                } else {
                    self.mute(&mut effects);
                    self.set_status(ControllerError::DeviceAccessDenied.to_string(), &mut effects);
                }
            }

            Signal::EndSession => {
                self.mute(&mut effects);
                self.set_status("Ending session", &mut effects);
                effects.push(Effect::Teardown);
            }
            Signal::Tick => {
                let timeout = self.settings.utterance_timeout;
                for speaker in [Speaker::Avatar, Speaker::User] {
                    let buffer = match speaker {
                        Speaker::Avatar => &mut self.avatar,
                        Speaker::User => &mut self.user,
                    };
                    if let Some(idle) = buffer.check_stall(now, timeout) {
                        let stall = ControllerError::TransportStall {
                            speaker,
                            idle_ms: idle.as_millis() as u64,
                        };
                        effects.push(Effect::Stalled { speaker, idle });
                        self.set_status(stall.to_string(), &mut effects);
                    }
                }
            }
        }

        Ok(effects)
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let caption = |buffer: &UtteranceBuffer| {
            buffer.is_open().then(|| buffer.partial().to_string())
        };
        let stalled = [(Speaker::Avatar, &self.avatar), (Speaker::User, &self.user)]
            .into_iter()
            .filter(|(_, buffer)| buffer.is_stalled())
            .map(|(speaker, _)| speaker)
            .collect();

        ConversationSnapshot {
            mode: self.mode(),
            state: self.state.as_str(),
            current_turn: self.state.current_turn(),
            capturing_response: self.capturing_response(),
            introduction: self.introduction.clone(),
            turns: self.turns.clone(),
            media: self.media,
            captions: Captions {
                avatar: caption(&self.avatar),
                user: caption(&self.user),
            },
            stalled,
            status: self.status.clone(),
            closing_remark: self.closing_remark.clone(),
            stats: ConversationStats {
                questions_asked: self.turns.len(),
                responses_recorded: self.turns.iter().filter(|turn| turn.is_answered()).count(),
                duration_secs: (Utc::now() - self.started_at).num_seconds(),
            },
        }
    }

    fn start(&mut self, effects: &mut Vec<Effect>) -> Result<(), ControllerError> {
        if self.state != ConversationState::Idle {
            return Err(self.invalid("start the conversation"));
        }
        self.state = ConversationState::Introducing;

        match self.mode() {
            ConversationMode::Scripted => {
                if let Some(introduction) = self.settings.introduction.clone() {
                    self.introduction = Some(introduction.clone());
                    effects.push(Effect::Speak {
                        text: introduction,
                        task: TaskType::Repeat,
                        fallback: None,
                    });
                }
                self.set_status("Introducing the interview", effects);
            }
            ConversationMode::FreeForm => {
                self.set_status("Waiting for the avatar to introduce itself", effects);
                self.request_opening(effects);
            }
        }
        Ok(())
    }

    fn begin(&mut self, effects: &mut Vec<Effect>) -> Result<(), ControllerError> {
        if self.mode() != ConversationMode::Scripted {
            return Err(ControllerError::UnsupportedSignal {
                signal: "begin",
                mode: self.mode().as_str(),
            });
        }
        if self.state != ConversationState::Introducing {
            return Err(self.invalid("begin the questions"));
        }
        let first = self.source.advance(0);
        self.follow(first, effects);
        Ok(())
    }

    fn accept_response(&mut self, text: &str, effects: &mut Vec<Effect>) -> Result<(), ControllerError> {
        let index = match self.state {
            ConversationState::AwaitingResponse(index) => index,
            _ => return Err(self.invalid("submit a response")),
        };
        if self.media.avatar_speaking {
            return Err(ControllerError::AvatarSpeaking);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ControllerError::EmptyResponse);
        }

        let turn = &mut self.turns[index];
        turn.response = Some(text.to_string());
        effects.push(Effect::RecordTurn(turn.clone()));
        self.user.reset();

        match self.source.advance(index + 1) {
            Advance::AwaitAvatar => self.set_status("Response recorded", effects),
            next => self.follow(next, effects),
        }
        Ok(())
    }

    fn on_avatar_utterance(&mut self, text: String, effects: &mut Vec<Effect>) {
        if self.state != ConversationState::Completed && self.source.concludes(&text) {
            self.closing_remark = Some(text);
            self.complete(effects);
            return;
        }

        match self.state {
            ConversationState::Idle => {
                self.set_status("Avatar speech ignored before the conversation started", effects);
            }
            ConversationState::Introducing => self.open_turn(text, effects),
            ConversationState::AwaitingResponse(index) => {
                if self.turns[index].is_answered() {
                    self.open_turn(text, effects);
                } else {
                    let turn = &mut self.turns[index];
                    turn.prompt.push(' ');
                    turn.prompt.push_str(&text);
                }
            }
            ConversationState::Completed => {
                let remark = self.closing_remark.get_or_insert_with(String::new);
                if !remark.is_empty() {
                    remark.push(' ');
                }
                remark.push_str(&text);
            }
        }
    }

    fn toggle_microphone(&mut self, effects: &mut Vec<Effect>) -> Result<(), ControllerError> {
        self.require_free_form("toggle_microphone")?;
        if self.media.voice_disabled {
            return Err(ControllerError::DeviceAccessDenied);
        }
        if !self.media.stream_ready || !self.media.voice_chat_started {
            return Err(ControllerError::NotReady);
        }
        if self.media.avatar_speaking {
            return Err(ControllerError::AvatarSpeaking);
        }

        if self.media.mic_active {
            self.mute(effects);
            self.set_status("Microphone off", effects);
        } else {
            if matches!(self.state, ConversationState::Idle | ConversationState::Completed) {
                return Err(self.invalid("turn on the microphone"));
            }
            self.media.mic_active = true;
            effects.push(Effect::StartListening);
            self.set_status("Listening...", effects);
        }
        Ok(())
    }

    fn request_opening(&mut self, effects: &mut Vec<Effect>) {
        let ready = self.mode() == ConversationMode::FreeForm
            && self.state == ConversationState::Introducing
            && self.media.voice_chat_started
            && !self.opening_requested;
        if !ready || self.settings.opening_message.is_empty() {
            return;
        }

        self.opening_requested = true;
        effects.push(Effect::Speak {
            text: self.settings.opening_message.clone(),
            task: TaskType::Talk,
            fallback: self.settings.fallback_introduction.clone(),
        });
    }

    fn follow(&mut self, next: Advance, effects: &mut Vec<Effect>) {
        match next {
            Advance::Prompt(prompt) => self.open_turn(prompt, effects),
            Advance::Completed => self.complete(effects),
            Advance::AwaitAvatar => {}
        }
    }

    fn open_turn(&mut self, prompt: String, effects: &mut Vec<Effect>) {
        debug_assert!(self.turns.last().map_or(true, Turn::is_answered));

        let index = self.turns.len();
        self.turns.push(Turn::open(index, prompt.clone()));
        self.state = ConversationState::AwaitingResponse(index);

        if self.mode() == ConversationMode::Scripted {
            effects.push(Effect::Speak {
                text: prompt,
                task: TaskType::Repeat,
                fallback: None,
            });
        }
        self.set_status(format!("Question {}", index + 1), effects);
    }

    fn complete(&mut self, effects: &mut Vec<Effect>) {
        self.state = ConversationState::Completed;
        self.user.reset();
        self.mute(effects);
        self.set_status("Session complete", effects);
        effects.push(Effect::Completed);
    }

    fn mute(&mut self, effects: &mut Vec<Effect>) {
        if self.media.mic_active {
            self.media.mic_active = false;
            effects.push(Effect::StopListening);
        }
    }

    fn set_status(&mut self, status: impl Into<String>, effects: &mut Vec<Effect>) {
        self.status = status.into();
        effects.push(Effect::Status(self.status.clone()));
    }

    fn require_free_form(&self, signal: &'static str) -> Result<(), ControllerError> {
        match self.mode() {
            ConversationMode::FreeForm => Ok(()),
            mode => Err(ControllerError::UnsupportedSignal { signal, mode: mode.as_str() }),
        }
    }

    fn invalid(&self, action: &'static str) -> ControllerError {
        ControllerError::InvalidState {
            action,
            state: self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            introduction: Some("Welcome to the practice pitch.".to_string()),
            opening_message: "Hello! Please state your role.".to_string(),
            fallback_introduction: Some("Hi, I'm your investor today.".to_string()),
            utterance_timeout: Duration::from_millis(500),
        }
    }

    fn scripted(prompts: &[&str]) -> TurnController {
        let prompts = prompts.iter().map(|p| p.to_string()).collect();
        TurnController::new(PromptSource::Scripted { prompts }, settings())
    }

    fn free_form() -> TurnController {
        TurnController::new(
            PromptSource::FreeForm {
                termination_phrase: "Session complete".to_string(),
            },
            settings(),
        )
    }

    /// Stream `text` word by word as one utterance, then close it.
    fn say(controller: &mut TurnController, speaker: Speaker, text: &str, now: Instant) -> Vec<Effect> {
        for (sequence, word) in text.split_inclusive(' ').enumerate() {
            let signal = match speaker {
                Speaker::Avatar => Signal::AvatarFragment { sequence: sequence as u64, text: word.to_string() },
                Speaker::User => Signal::UserFragment { sequence: sequence as u64, text: word.to_string() },
            };
            controller.apply(signal, now).unwrap();
        }
        let end = match speaker {
            Speaker::Avatar => Signal::AvatarUtteranceEnd,
            Speaker::User => Signal::UserUtteranceEnd,
        };
        controller.apply(end, now).unwrap()
    }

    fn voice_ready(controller: &mut TurnController, now: Instant) {
        controller.apply(Signal::StreamReady, now).unwrap();
        controller.apply(Signal::VoiceChatStarted, now).unwrap();
    }

    fn recorded(effects: &[Effect]) -> Vec<Turn> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::RecordTurn(turn) => Some(turn.clone()),
                _ => None,
            })
            .collect()
    }

    fn spoken(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Speak { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_scripted_conversation_walks_every_prompt() {
        let now = Instant::now();
        let mut controller = scripted(&["What do you build?", "Who pays?"]);

        let effects = controller.apply(Signal::Start, now).unwrap();
        assert_eq!(controller.state(), ConversationState::Introducing);
        assert_eq!(spoken(&effects), vec!["Welcome to the practice pitch."]);
        assert!(controller.turns().is_empty());

        let effects = controller.apply(Signal::Begin, now).unwrap();
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));
        assert_eq!(spoken(&effects), vec!["What do you build?"]);

        let effects = controller
            .apply(Signal::SubmitResponse { text: "  Scheduling software ".to_string() }, now)
            .unwrap();
        let turns = recorded(&effects);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].index, 0);
        assert_eq!(turns[0].response.as_deref(), Some("Scheduling software"));
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(1));
        assert_eq!(spoken(&effects), vec!["Who pays?"]);

        let effects = controller
            .apply(Signal::SubmitResponse { text: "Clinics".to_string() }, now)
            .unwrap();
        assert_eq!(controller.state(), ConversationState::Completed);
        assert!(effects.contains(&Effect::Completed));
        assert_eq!(controller.turns().len(), 2);
        assert!(controller.turns().iter().all(Turn::is_answered));
    }

    #[test]
    fn test_empty_prompt_list_completes_on_begin() {
        let now = Instant::now();
        let mut controller = scripted(&[]);
        controller.apply(Signal::Start, now).unwrap();

        let effects = controller.apply(Signal::Begin, now).unwrap();
        assert_eq!(controller.state(), ConversationState::Completed);
        assert!(effects.contains(&Effect::Completed));
        assert!(controller.turns().is_empty());
    }

    #[test]
    fn test_guards_leave_state_untouched() {
        let now = Instant::now();
        let mut controller = scripted(&["Q1", "Q2"]);

        let err = controller
            .apply(Signal::SubmitResponse { text: "early".to_string() }, now)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { .. }));
        assert!(controller.apply(Signal::Begin, now).is_err());

        controller.apply(Signal::Start, now).unwrap();
        controller.apply(Signal::Begin, now).unwrap();

        let err = controller
            .apply(Signal::SubmitResponse { text: " \n\t".to_string() }, now)
            .unwrap_err();
        assert_eq!(err, ControllerError::EmptyResponse);
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));
        assert_eq!(controller.turns()[0].response, None);

        controller.apply(Signal::AvatarStartTalking, now).unwrap();
        let err = controller
            .apply(Signal::SubmitResponse { text: "answer".to_string() }, now)
            .unwrap_err();
        assert_eq!(err, ControllerError::AvatarSpeaking);
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));
        assert!(!controller.capturing_response());

        controller.apply(Signal::AvatarStopTalking, now).unwrap();
        controller
            .apply(Signal::SubmitResponse { text: "answer".to_string() }, now)
            .unwrap();
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(1));
        assert!(controller.apply(Signal::Start, now).is_err());
    }

    #[test]
    fn test_scripted_rejects_streaming_signals() {
        let now = Instant::now();
        let mut controller = scripted(&["Q1"]);
        let err = controller
            .apply(Signal::AvatarFragment { sequence: 0, text: "hi".to_string() }, now)
            .unwrap_err();
        assert_eq!(
            err,
            ControllerError::UnsupportedSignal { signal: "avatar_fragment", mode: "scripted" }
        );

        // Streams never start voice chat in scripted mode.
        let effects = controller.apply(Signal::StreamReady, now).unwrap();
        assert!(!effects.contains(&Effect::StartVoiceChat));
    }

    #[test]
    fn test_free_form_turns_follow_the_avatar() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();

        say(&mut controller, Speaker::Avatar, "Hi, I'm Dana. What's your role?", now);
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));
        assert_eq!(controller.turns()[0].prompt, "Hi, I'm Dana. What's your role?");

        let effects = say(&mut controller, Speaker::User, "I'm the CEO of Acme", now);
        assert_eq!(recorded(&effects)[0].response.as_deref(), Some("I'm the CEO of Acme"));
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));

        // A second answer before the avatar moves on replaces the first.
        let effects = say(&mut controller, Speaker::User, "CEO and founder of Acme", now);
        let revised = recorded(&effects);
        assert_eq!(revised[0].index, 0);
        assert_eq!(revised[0].response.as_deref(), Some("CEO and founder of Acme"));

        say(&mut controller, Speaker::Avatar, "How big is the market?", now);
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(1));
        assert_eq!(controller.turns().len(), 2);

        say(&mut controller, Speaker::User, "Ten billion dollars", now);
        let effects = say(&mut controller, Speaker::Avatar, "Thanks. SESSION COMPLETE.", now);
        assert_eq!(controller.state(), ConversationState::Completed);
        assert!(effects.contains(&Effect::Completed));
        assert_eq!(controller.turns().len(), 2);
        assert_eq!(controller.snapshot().closing_remark.as_deref(), Some("Thanks. SESSION COMPLETE."));
    }

    #[test]
    fn test_avatar_follow_up_without_answer_extends_prompt() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();

        say(&mut controller, Speaker::Avatar, "What's your role?", now);
        say(&mut controller, Speaker::Avatar, "Take your time.", now);

        assert_eq!(controller.turns().len(), 1);
        assert_eq!(controller.turns()[0].prompt, "What's your role? Take your time.");
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));
    }

    #[test]
    fn test_fragment_gap_is_a_protocol_violation() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();
        controller
            .apply(Signal::AvatarFragment { sequence: 0, text: "What ".to_string() }, now)
            .unwrap();

        let err = controller
            .apply(Signal::AvatarFragment { sequence: 2, text: "role?".to_string() }, now)
            .unwrap_err();
        assert!(matches!(err, ControllerError::ProtocolViolation { speaker: Speaker::Avatar, .. }));

        controller
            .apply(Signal::AvatarFragment { sequence: 1, text: "is your role?".to_string() }, now)
            .unwrap();
        controller.apply(Signal::AvatarUtteranceEnd, now).unwrap();
        assert_eq!(controller.turns()[0].prompt, "What is your role?");
    }

    #[test]
    fn test_empty_utterance_end_is_ignored() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();

        let effects = controller.apply(Signal::AvatarUtteranceEnd, now).unwrap();
        assert!(effects.is_empty());
        assert_eq!(controller.state(), ConversationState::Introducing);
    }

    #[test]
    fn test_stall_is_reported_once_and_late_fragments_attach() {
        let start = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, start).unwrap();
        say(&mut controller, Speaker::Avatar, "What's your traction?", start);

        controller
            .apply(Signal::UserFragment { sequence: 0, text: "We have".to_string() }, start)
            .unwrap();

        let effects = controller.apply(Signal::Tick, start + Duration::from_millis(200)).unwrap();
        assert!(effects.is_empty());

        let effects = controller.apply(Signal::Tick, start + Duration::from_secs(1)).unwrap();
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::Stalled { speaker: Speaker::User, .. })));
        assert_eq!(controller.snapshot().stalled, vec![Speaker::User]);
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));

        let effects = controller.apply(Signal::Tick, start + Duration::from_secs(2)).unwrap();
        assert!(effects.is_empty());

        controller
            .apply(
                Signal::UserFragment { sequence: 1, text: " 40 paying customers".to_string() },
                start + Duration::from_secs(3),
            )
            .unwrap();
        let effects = controller
            .apply(Signal::UserUtteranceEnd, start + Duration::from_secs(3))
            .unwrap();
        assert_eq!(recorded(&effects)[0].response.as_deref(), Some("We have 40 paying customers"));
    }

    #[test]
    fn test_stalled_avatar_question_lands_in_next_turn() {
        let start = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, start).unwrap();
        say(&mut controller, Speaker::Avatar, "What's your traction?", start);
        say(&mut controller, Speaker::User, "40 paying customers", start);

        controller
            .apply(Signal::AvatarFragment { sequence: 0, text: "What about".to_string() }, start)
            .unwrap();
        let effects = controller.apply(Signal::Tick, start + Duration::from_secs(1)).unwrap();
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::Stalled { speaker: Speaker::Avatar, .. })));
        assert_eq!(controller.snapshot().stalled, vec![Speaker::Avatar]);
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(0));

        let late = start + Duration::from_secs(2);
        controller
            .apply(Signal::AvatarFragment { sequence: 1, text: " churn?".to_string() }, late)
            .unwrap();
        controller.apply(Signal::AvatarUtteranceEnd, late).unwrap();

        assert_eq!(controller.turns().len(), 2);
        assert_eq!(controller.turns()[0].response.as_deref(), Some("40 paying customers"));
        assert_eq!(controller.turns()[1].prompt, "What about churn?");
        assert_eq!(controller.state(), ConversationState::AwaitingResponse(1));
        assert!(controller.snapshot().stalled.is_empty());
    }

    #[test]
    fn test_manual_submit_recovers_from_stall() {
        let start = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, start).unwrap();
        say(&mut controller, Speaker::Avatar, "What's your traction?", start);
        controller
            .apply(Signal::UserFragment { sequence: 0, text: "We".to_string() }, start)
            .unwrap();
        controller.apply(Signal::Tick, start + Duration::from_secs(1)).unwrap();

        controller
            .apply(Signal::SubmitResponse { text: "40 customers".to_string() }, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(controller.turns()[0].response.as_deref(), Some("40 customers"));
        assert!(controller.snapshot().stalled.is_empty());
        assert!(controller.snapshot().captions.user.is_none());
    }

    #[test]
    fn test_voice_chat_startup_and_opening_message() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();

        let effects = controller.apply(Signal::StreamReady, now).unwrap();
        assert!(effects.contains(&Effect::StartVoiceChat));
        let effects = controller.apply(Signal::StreamReady, now).unwrap();
        assert!(!effects.contains(&Effect::StartVoiceChat));

        let effects = controller.apply(Signal::VoiceChatStarted, now).unwrap();
        assert!(effects.contains(&Effect::Speak {
            text: "Hello! Please state your role.".to_string(),
            task: TaskType::Talk,
            fallback: Some("Hi, I'm your investor today.".to_string()),
        }));

        // Only one opening per conversation.
        let effects = controller.apply(Signal::VoiceChatStarted, now).unwrap();
        assert!(spoken(&effects).is_empty());
    }

    #[test]
    fn test_voice_chat_failure_allows_another_attempt() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::StreamReady, now).unwrap();
        controller
            .apply(Signal::VoiceChatFailed { reason: "timeout".to_string() }, now)
            .unwrap();
        assert_eq!(controller.status(), "Voice chat error: timeout");

        let effects = controller.apply(Signal::StreamReady, now).unwrap();
        assert!(effects.contains(&Effect::StartVoiceChat));
    }

    #[test]
    fn test_microphone_gate() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();

        assert_eq!(
            controller.apply(Signal::ToggleMicrophone, now).unwrap_err(),
            ControllerError::NotReady
        );

        voice_ready(&mut controller, now);
        let effects = controller.apply(Signal::ToggleMicrophone, now).unwrap();
        assert!(effects.contains(&Effect::StartListening));
        assert!(controller.media().mic_active);

        let effects = controller.apply(Signal::AvatarStartTalking, now).unwrap();
        assert!(effects.contains(&Effect::StopListening));
        assert!(!controller.media().mic_active);
        assert!(controller.media().avatar_speaking);

        assert_eq!(
            controller.apply(Signal::ToggleMicrophone, now).unwrap_err(),
            ControllerError::AvatarSpeaking
        );
        assert!(!controller.media().mic_active);

        let effects = controller.apply(Signal::AvatarStopTalking, now).unwrap();
        assert!(effects.contains(&Effect::StopListening));
        assert!(!controller.media().mic_active);

        controller.apply(Signal::ToggleMicrophone, now).unwrap();
        let effects = controller.apply(Signal::UserSilence, now).unwrap();
        assert!(effects.contains(&Effect::StopListening));
        assert!(!controller.media().mic_active);

        controller.apply(Signal::ToggleMicrophone, now).unwrap();
        controller
            .apply(Signal::MicrophoneFailed { reason: "listen failed".to_string() }, now)
            .unwrap();
        assert!(!controller.media().mic_active);
    }

    #[test]
    fn test_denied_microphone_keeps_typed_answers() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();
        voice_ready(&mut controller, now);
        say(&mut controller, Speaker::Avatar, "What's your role?", now);

        controller.apply(Signal::MicrophoneAccess { granted: false }, now).unwrap();
        assert!(controller.media().voice_disabled);
        assert_eq!(
            controller.apply(Signal::ToggleMicrophone, now).unwrap_err(),
            ControllerError::DeviceAccessDenied
        );

        controller
            .apply(Signal::SubmitResponse { text: "Founder".to_string() }, now)
            .unwrap();
        assert_eq!(controller.turns()[0].response.as_deref(), Some("Founder"));
    }

    #[test]
    fn test_stream_disconnect_resets_media_and_requests_teardown() {
        let now = Instant::now();
        let mut controller = free_form();
        controller.apply(Signal::Start, now).unwrap();
        voice_ready(&mut controller, now);
        controller.apply(Signal::AvatarStartTalking, now).unwrap();

        let effects = controller.apply(Signal::StreamDisconnected, now).unwrap();
        assert!(effects.contains(&Effect::Teardown));
        assert_eq!(controller.media(), MediaFlags::default());
    }

    #[test]
    fn test_signal_wire_format() {
        let signal: Signal = serde_json::from_str(r#"{"type":"submit_response","text":"hi"}"#).unwrap();
        assert_eq!(signal, Signal::SubmitResponse { text: "hi".to_string() });

        let signal: Signal =
            serde_json::from_str(r#"{"type":"avatar_fragment","sequence":3,"text":"ok"}"#).unwrap();
        assert_eq!(signal.name(), "avatar_fragment");

        let json = serde_json::to_value(Signal::MicrophoneAccess { granted: false }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "microphone_access", "granted": false}));
    }

    fn any_signal() -> impl Strategy<Value = Signal> {
        prop_oneof![
            Just(Signal::Start),
            Just(Signal::StreamReady),
            Just(Signal::VoiceChatStarted),
            Just(Signal::AvatarStartTalking),
            Just(Signal::AvatarStopTalking),
            Just(Signal::AvatarUtteranceEnd),
            Just(Signal::UserUtteranceEnd),
            Just(Signal::UserSilence),
            Just(Signal::ToggleMicrophone),
            Just(Signal::Tick),
            (0u64..3, "[a-z ]{0,8}").prop_map(|(sequence, text)| Signal::AvatarFragment { sequence, text }),
            (0u64..3, "[a-z ]{0,8}").prop_map(|(sequence, text)| Signal::UserFragment { sequence, text }),
            "[a-z ]{0,8}".prop_map(|text| Signal::SubmitResponse { text }),
            any::<bool>().prop_map(|granted| Signal::MicrophoneAccess { granted }),
        ]
    }

    proptest! {
        #[test]
        fn prop_turn_and_microphone_invariants(signals in prop::collection::vec(any_signal(), 0..80)) {
            let start = Instant::now();
            let mut controller = free_form();

            for (step, signal) in signals.into_iter().enumerate() {
                let now = start + Duration::from_millis(step as u64 * 100);
                let _ = controller.apply(signal, now);

                let media = controller.media();
                prop_assert!(!(media.mic_active && media.avatar_speaking));

                let turns = controller.turns();
                for (index, turn) in turns.iter().enumerate() {
                    prop_assert_eq!(turn.index, index);
                    if index + 1 < turns.len() {
                        prop_assert!(turn.is_answered());
                    }
                }
                if let Some(current) = controller.state().current_turn() {
                    prop_assert_eq!(current + 1, turns.len());
                }
            }
        }
    }
}
