//! Clue mood value object
//!
//! The mood is the emotional colour an NPC attaches to a clue. The LLM is
//! asked for one of a handful of known moods, but anything it returns is
//! preserved so the UI can decide how to present it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Emotional tone attached to a generated clue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClueMood {
    /// Default tone when the model gives none
    #[default]
    Neutral,
    Amused,
    Cryptic,
    Frustrated,
    Excited,
    /// A mood outside the known set, kept verbatim (trimmed)
    Other(String),
}

impl ClueMood {
    /// Known moods, in the order they are offered to the model
    pub fn known() -> &'static [ClueMood] {
        &[
            ClueMood::Neutral,
            ClueMood::Amused,
            ClueMood::Cryptic,
            ClueMood::Frustrated,
            ClueMood::Excited,
        ]
    }

    /// Parse a mood from model output.
    ///
    /// Blank input yields `Neutral`; unknown values become `Other`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "neutral" => ClueMood::Neutral,
            "amused" => ClueMood::Amused,
            "cryptic" => ClueMood::Cryptic,
            "frustrated" => ClueMood::Frustrated,
            "excited" => ClueMood::Excited,
            _ => ClueMood::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ClueMood::Neutral => "neutral",
            ClueMood::Amused => "amused",
            ClueMood::Cryptic => "cryptic",
            ClueMood::Frustrated => "frustrated",
            ClueMood::Excited => "excited",
            ClueMood::Other(value) => value,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ClueMood::Other(_))
    }
}

impl fmt::Display for ClueMood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ClueMood {
    fn from(value: String) -> Self {
        ClueMood::parse(&value)
    }
}

impl From<ClueMood> for String {
    fn from(value: ClueMood) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_mood_is_neutral() {
        assert_eq!(ClueMood::parse(""), ClueMood::Neutral);
        assert_eq!(ClueMood::parse("   "), ClueMood::Neutral);
    }

    #[test]
    fn known_moods_parse_case_insensitively() {
        assert_eq!(ClueMood::parse("Cryptic"), ClueMood::Cryptic);
        assert_eq!(ClueMood::parse(" EXCITED "), ClueMood::Excited);
    }

    #[test]
    fn unknown_mood_is_preserved() {
        let mood = ClueMood::parse("  smug ");
        assert_eq!(mood, ClueMood::Other("smug".to_string()));
        assert!(!mood.is_known());
        assert_eq!(mood.to_string(), "smug");
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&ClueMood::Amused).unwrap();
        assert_eq!(json, "\"amused\"");

        let parsed: ClueMood = serde_json::from_str("\"frustrated\"").unwrap();
        assert_eq!(parsed, ClueMood::Frustrated);
    }
}
