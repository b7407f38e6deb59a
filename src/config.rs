//! # Configuration Management
//!
//! Application configuration is layered from several sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP__` prefix (`APP__SERVER__PORT=9000`)
//! - The deployment variables `HOST`, `PORT`, `HEYGEN_API_KEY`, `AVATAR_ID`
//!   and `VOICE_ID`
//!
//! ## Secrets:
//! The vendor API key is wrapped in [`ApiKey`], whose `Debug` output is redacted
//! and which is never serialized back out. Only short-lived credentials derived
//! from it ever leave the process.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub vendor: VendorConfig,
    pub conversation: ConversationConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Long-lived vendor secret. Debug output and serialization never expose it.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(clean_env_value(raw.as_ref()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(<redacted, {} chars>)", self.0.len())
    }
}

/// Avatar-streaming vendor settings.
///
/// ## Fields:
/// - `api_key`: long-lived secret used only server-side to mint credentials
/// - `base_url`: vendor REST root (overridable for tests and staging)
/// - `avatar_id` / `voice_id`: which persona and synthesized voice to render
/// - `emotion`, `rate`, `quality`: voice tone preset, speaking rate, rendering tier
/// - `language`: conversation language for speech recognition and synthesis
/// - `disable_idle_timeout`: keep the vendor from closing a quiet session
/// - `verify_voice`: check the voice id against the vendor voice list before
///   provisioning a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(default, skip_serializing)]
    pub api_key: Option<ApiKey>,
    pub base_url: String,
    pub avatar_id: String,
    pub voice_id: String,
    pub emotion: String,
    pub rate: f32,
    pub quality: String,
    pub language: String,
    pub disable_idle_timeout: bool,
    pub verify_voice: bool,
    pub request_timeout_ms: u64,
}

/// Conversation flow settings shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Spoken before the first scripted prompt.
    pub introduction: String,
    /// Default scripted prompts when a session request does not bring its own.
    pub prompts: Vec<String>,
    /// Free-form mode ends once the avatar says this.
    pub termination_phrase: String,
    /// Persona and interview rules handed to the avatar's language model in
    /// free-form mode.
    pub knowledge_base: String,
    /// Sent as a TALK task once voice chat is up in free-form mode.
    pub opening_message: String,
    /// Spoken verbatim if the opening TALK task fails.
    pub fallback_introduction: String,
    /// How long an utterance may go without a fragment or terminal signal.
    pub utterance_timeout_ms: u64,
    /// Delay between stream readiness and starting voice chat.
    pub stream_stabilization_ms: u64,
    /// Delay between completion and teardown, so the closing line is heard.
    pub completion_grace_ms: u64,
    pub voice_chat_start_attempts: u32,
    pub voice_chat_retry_delay_ms: u64,
    pub listening_start_attempts: u32,
    pub listening_retry_delay_ms: u64,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// WebSocket ping interval.
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

const DEFAULT_KNOWLEDGE_BASE: &str = "\
You are a startup analyst preparing an investor profile. You have reviewed the founder's \
pitch deck and public material, and now ask a short set of follow-up questions to clarify \
the business fundamentals. Your tone is friendly, professional and precise.

## Session Rules:
- The whole conversation must not exceed 5 minutes.
- Ask no more than 6 questions in total, follow-ups included. A question may ask two \
related things, but never at length.
- Prioritize gaps in the revenue model, product-market fit, traction and team.
- After the last answer, thank the founder and close briefly.

Begin by introducing yourself and asking about the revenue model. When you have asked \
all your questions, end by saying: \"Thank you for your time. This concludes our \
conversation. Session complete.\" Always end the session with these words.";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            vendor: VendorConfig {
                api_key: None,
                base_url: "https://api.heygen.com".to_string(),
                avatar_id: String::new(),
                voice_id: String::new(),
                emotion: "friendly".to_string(),
                rate: 1.0,
                quality: "high".to_string(),
                language: "en".to_string(),
                disable_idle_timeout: true,
                verify_voice: false,
                request_timeout_ms: 15_000,
            },
            conversation: ConversationConfig {
                introduction: "Hello! I've reviewed the details you shared. \
                               I'd like to clarify a few things to complete your profile."
                    .to_string(),
                prompts: Vec::new(),
                termination_phrase: "Session complete".to_string(),
                knowledge_base: DEFAULT_KNOWLEDGE_BASE.to_string(),
                opening_message: "Hello! Please state your role, and the name of your startup."
                    .to_string(),
                fallback_introduction: "Hello! I've reviewed the details you shared. \
                                        Let's start with your revenue model: how do you \
                                        currently generate revenue?"
                    .to_string(),
                utterance_timeout_ms: 15_000,
                stream_stabilization_ms: 2_000,
                completion_grace_ms: 12_000,
                voice_chat_start_attempts: 3,
                voice_chat_retry_delay_ms: 1_500,
                listening_start_attempts: 2,
                listening_retry_delay_ms: 1_000,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: override server port
    /// - `APP__CONVERSATION__UTTERANCE_TIMEOUT_MS=20000`: override stall timeout
    /// - `HEYGEN_API_KEY="sk-..."`: vendor secret (quotes and whitespace are stripped)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        for (var, key) in [
            ("HEYGEN_API_KEY", "vendor.api_key"),
            ("AVATAR_ID", "vendor.avatar_id"),
            ("VOICE_ID", "vendor.voice_id"),
        ] {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, clean_env_value(&value))?;
            }
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        // Values from config.toml bypass the env cleaning above.
        if let Some(key) = config.vendor.api_key.take() {
            let key = ApiKey::new(key.expose());
            config.vendor.api_key = (!key.is_blank()).then_some(key);
        }
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing vendor key is not fatal here: the server still starts and
    /// every credential request fails with a configuration error instead.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if !self.vendor.base_url.starts_with("http://") && !self.vendor.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!("Vendor base URL must be http(s): {}", self.vendor.base_url));
        }

        if self.conversation.utterance_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Utterance timeout must be greater than 0"));
        }

        if self.conversation.voice_chat_start_attempts == 0 || self.conversation.listening_start_attempts == 0 {
            return Err(anyhow::anyhow!("Voice capture start needs at least one attempt"));
        }

        if self.conversation.termination_phrase.trim().is_empty() {
            return Err(anyhow::anyhow!("Termination phrase cannot be empty"));
        }

        if self.vendor.rate <= 0.0 {
            return Err(anyhow::anyhow!("Voice rate must be positive"));
        }

        Ok(())
    }

    pub fn has_vendor_key(&self) -> bool {
        self.vendor.api_key.as_ref().is_some_and(|key| !key.is_blank())
    }
}

impl ConversationConfig {
    pub fn utterance_timeout(&self) -> Duration {
        Duration::from_millis(self.utterance_timeout_ms)
    }
}

/// Strip surrounding whitespace and double quotes from an environment value.
///
/// Hosting dashboards frequently store `"value"` with the quotes included.
pub fn clean_env_value(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}
