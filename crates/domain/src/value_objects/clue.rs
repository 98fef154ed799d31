//! Clue request and result value objects
//!
//! - `PromptContext`: everything needed to ask for one clue
//! - `AssembledPrompt`: the system prompt and user message sent to a backend
//! - `ClueResult`: the clue handed back to the game

use serde::{Deserialize, Serialize};

use super::{ClueMood, NpcIdentity};
use crate::DomainError;

/// Input for a single clue request.
///
/// Built fresh per request by the caller; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    pub npc: NpcIdentity,
    pub target_word: String,
    pub category: String,
    /// 1-based clue index; each clue should be more specific than the last
    pub clue_index: u32,
    /// Wrong guesses so far, oldest first
    #[serde(default)]
    pub previous_guesses: Vec<String>,
    /// Display names of active modifiers (Tome effects)
    #[serde(default)]
    pub active_modifiers: Vec<String>,
}

impl PromptContext {
    pub fn new(
        npc: NpcIdentity,
        target_word: impl Into<String>,
        category: impl Into<String>,
        clue_index: u32,
    ) -> Self {
        Self {
            npc,
            target_word: target_word.into(),
            category: category.into(),
            clue_index,
            previous_guesses: Vec::new(),
            active_modifiers: Vec::new(),
        }
    }

    pub fn with_previous_guesses<I, S>(mut self, guesses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.previous_guesses = guesses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modifiers<I, S>(mut self, modifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_modifiers = modifiers.into_iter().map(Into::into).collect();
        self
    }

    /// Number of letters in the target word (counted in chars, not bytes)
    pub fn letter_count(&self) -> usize {
        self.target_word.chars().count()
    }

    /// Reject requests the pipeline cannot give a meaningful clue for.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.target_word.trim().is_empty() {
            return Err(DomainError::validation("Target word cannot be empty"));
        }
        if self.clue_index == 0 {
            return Err(DomainError::validation("Clue numbers start at 1"));
        }
        Ok(())
    }
}

/// System prompt and user message for one inference call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub user_message: String,
}

/// A clue ready to show the player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClueResult {
    pub clue_text: String,
    #[serde(default)]
    pub mood: ClueMood,
    /// True when the clue did not come from a live model
    pub used_fallback: bool,
    pub generation_time_ms: f32,
}

impl ClueResult {
    /// A clue parsed from model output; timing is filled in by the caller.
    pub fn generated(clue_text: impl Into<String>, mood: ClueMood) -> Self {
        Self {
            clue_text: clue_text.into(),
            mood,
            used_fallback: false,
            generation_time_ms: 0.0,
        }
    }

    /// A pre-authored or synthesized clue
    pub fn fallback(clue_text: impl Into<String>) -> Self {
        Self {
            clue_text: clue_text.into(),
            mood: ClueMood::Neutral,
            used_fallback: true,
            generation_time_ms: 0.0,
        }
    }
}
