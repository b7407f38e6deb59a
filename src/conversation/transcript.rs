//! Transcript recording and export.

use crate::conversation::error::TranscriptError;
use crate::conversation::turn::Turn;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Exported question/answer pair. `id` is 1-based among answered turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: usize,
    pub question: String,
    pub answer: String,
}

/// Append-only, index-ordered record of a conversation's turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    /// Append the next turn, or revise the response of the latest one.
    pub fn record(&mut self, turn: Turn) -> Result<(), TranscriptError> {
        if !turn.is_answered() {
            return Err(TranscriptError::Unanswered(turn.index));
        }

        let next = self.turns.len();
        let index = turn.index;
        if index == next {
            self.turns.push(turn);
        } else if index + 1 == next {
            self.turns[index] = turn;
        } else {
            return Err(TranscriptError::OutOfOrder {
                expected: next,
                received: index,
            });
        }
        Ok(())
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn export(&self) -> Vec<TranscriptEntry> {
        self.turns
            .iter()
            .filter_map(|turn| {
                let answer = turn.response.as_ref()?;
                Some((turn.prompt.clone(), answer.clone()))
            })
            .enumerate()
            .map(|(position, (question, answer))| TranscriptEntry {
                id: position + 1,
                question,
                answer,
            })
            .collect()
    }
}

/// Persistence seam for transcripts: save on every mutation, load on init.
pub trait TranscriptRepository: Send + Sync {
    fn load(&self, session_id: &str) -> Option<Transcript>;
    fn save(&self, session_id: &str, transcript: &Transcript);
}

/// Process-wide store; transcripts outlive their sessions until restart.
#[derive(Debug, Default)]
pub struct InMemoryTranscriptRepository {
    transcripts: RwLock<HashMap<String, Transcript>>,
}

impl InMemoryTranscriptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transcripts.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl TranscriptRepository for InMemoryTranscriptRepository {
    fn load(&self, session_id: &str) -> Option<Transcript> {
        self.transcripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn save(&self, session_id: &str, transcript: &Transcript) {
        self.transcripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), transcript.clone());
    }
}

/// Records one session's turns through a [`TranscriptRepository`].
pub struct TranscriptRecorder {
    session_id: String,
    transcript: Transcript,
    repository: Arc<dyn TranscriptRepository>,
}

impl TranscriptRecorder {
    pub fn open(session_id: impl Into<String>, repository: Arc<dyn TranscriptRepository>) -> Self {
        let session_id = session_id.into();
        let transcript = match repository.load(&session_id) {
            Some(transcript) => transcript,
            None => {
                // Registered up front so an unanswered session still exports `[]`.
                let transcript = Transcript::default();
                repository.save(&session_id, &transcript);
                transcript
            }
        };
        Self {
            session_id,
            transcript,
            repository,
        }
    }

    pub fn record(&mut self, turn: Turn) -> Result<(), TranscriptError> {
        self.transcript.record(turn)?;
        self.repository.save(&self.session_id, &self.transcript);
        Ok(())
    }

    pub fn export(&self) -> Vec<TranscriptEntry> {
        self.transcript.export()
    }
}

pub fn export_filename(date: NaiveDate) -> String {
    format!("interview_transcript_{}.json", date.format("%Y-%m-%d"))
}

pub fn render_export(entries: &[TranscriptEntry]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(entries)
}
