//! NPC identity used to personalise clue prompts

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DomainError;

/// NPC personality archetype that drives prompt selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpcArchetype {
    /// Speaks in riddles and metaphors
    Riddlemaster,
    /// Fast-talking salesperson
    TricksterMerchant,
    /// Terse, dictionary-style definitions
    SilentLibrarian,
}

impl NpcArchetype {
    pub fn all() -> &'static [NpcArchetype] {
        &[
            NpcArchetype::Riddlemaster,
            NpcArchetype::TricksterMerchant,
            NpcArchetype::SilentLibrarian,
        ]
    }

    /// Display name used in prompts
    pub fn display_name(&self) -> &'static str {
        match self {
            NpcArchetype::Riddlemaster => "Riddlemaster",
            NpcArchetype::TricksterMerchant => "Trickster Merchant",
            NpcArchetype::SilentLibrarian => "Silent Librarian",
        }
    }
}

impl fmt::Display for NpcArchetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for NpcArchetype {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "riddlemaster" => Ok(NpcArchetype::Riddlemaster),
            "merchant" | "trickstermerchant" => Ok(NpcArchetype::TricksterMerchant),
            "librarian" | "silentlibrarian" => Ok(NpcArchetype::SilentLibrarian),
            _ => Err(DomainError::parse(format!("Unknown NPC archetype: {}", s))),
        }
    }
}

/// Who is giving the clue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcIdentity {
    pub display_name: String,
    pub archetype: NpcArchetype,
    /// Personality prompt with `{displayName}`, `{archetype}`, `{category}`
    /// and `{clueNumber}` placeholders. May be empty.
    #[serde(default)]
    pub personality_template: String,
    #[serde(default)]
    pub is_boss: bool,
    /// Extra rule imposed on boss clues, e.g. "Your clues must be exactly 3 words."
    #[serde(default)]
    pub boss_constraint: Option<String>,
}

impl NpcIdentity {
    pub fn new(display_name: impl Into<String>, archetype: NpcArchetype) -> Self {
        Self {
            display_name: display_name.into(),
            archetype,
            personality_template: String::new(),
            is_boss: false,
            boss_constraint: None,
        }
    }

    pub fn with_personality(mut self, template: impl Into<String>) -> Self {
        self.personality_template = template.into();
        self
    }

    pub fn as_boss(mut self, constraint: impl Into<String>) -> Self {
        self.is_boss = true;
        self.boss_constraint = Some(constraint.into());
        self
    }

    /// The boss constraint, only when this NPC is a boss and the constraint is non-empty.
    pub fn active_boss_constraint(&self) -> Option<&str> {
        if !self.is_boss {
            return None;
        }
        self.boss_constraint
            .as_deref()
            .filter(|constraint| !constraint.is_empty())
    }
}
