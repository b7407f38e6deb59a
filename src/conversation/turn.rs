use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One prompt/response pair.
///
/// Created when the prompt is issued; the response is filled in when captured
/// and may be revised while the turn is still the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub prompt: String,
    pub response: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn open(index: usize, prompt: impl Into<String>) -> Self {
        Self {
            index,
            prompt: prompt.into(),
            response: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_answered(&self) -> bool {
        self.response.is_some()
    }
}

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Avatar,
    User,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Avatar => write!(f, "avatar"),
            Speaker::User => write!(f, "user"),
        }
    }
}
