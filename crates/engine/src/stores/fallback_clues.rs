//! Static fallback clue storage.
//!
//! Pre-authored clues used when no model is available or the model's answer
//! was unusable. The table is loaded once and is read-only afterwards, so
//! lookups need no locking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::Deserialize;

use spellwright_domain::ClueResult;

/// Clue data bundled with the binary
pub const BUNDLED_FALLBACK_CLUES: &str = include_str!("../../data/fallback_clues.json");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Fallback clue document is empty or has no words")]
    Empty,
    #[error("Failed to parse fallback clues: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to read fallback clues: {0}")]
    Io(#[from] std::io::Error),
}

/// One authored word: its category and clues, least specific first.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticClueEntry {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub clues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FallbackDocument {
    #[serde(default)]
    words: HashMap<String, StaticClueEntry>,
}

/// Case-insensitive table of pre-authored clues.
#[derive(Debug, Default)]
pub struct StaticFallbackStore {
    words: OnceLock<HashMap<String, StaticClueEntry>>,
}

impl StaticFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store loaded from the bundled data file.
    pub fn bundled() -> Self {
        let store = Self::new();
        store.load(BUNDLED_FALLBACK_CLUES);
        store
    }

    /// Load clues from a JSON document.
    ///
    /// Failures are logged and leave the store unloaded. Once a load has
    /// succeeded, further loads are ignored.
    pub fn load(&self, raw_json: &str) {
        if self.is_loaded() {
            tracing::debug!("Fallback clues already loaded, ignoring reload");
            return;
        }
        match self.try_load(raw_json) {
            Ok(count) => tracing::info!(words = count, "Loaded fallback clues"),
            Err(StoreError::Empty) => tracing::warn!("No words found in fallback clue data"),
            Err(e) => tracing::error!(error = %e, "Failed to load fallback clues"),
        }
    }

    /// Read and load a fallback clue file.
    pub fn load_from_path(&self, path: &Path) -> Result<usize, StoreError> {
        let raw_json = std::fs::read_to_string(path)?;
        let count = self.try_load(&raw_json)?;
        tracing::info!(path = %path.display(), words = count, "Loaded fallback clues");
        Ok(count)
    }

    fn try_load(&self, raw_json: &str) -> Result<usize, StoreError> {
        if raw_json.trim().is_empty() {
            return Err(StoreError::Empty);
        }

        let document: FallbackDocument = serde_json::from_str(raw_json)?;
        if document.words.is_empty() {
            return Err(StoreError::Empty);
        }

        let words: HashMap<String, StaticClueEntry> = document
            .words
            .into_iter()
            .map(|(word, entry)| (normalize(&word), entry))
            .collect();

        let table = self.words.get_or_init(|| words);
        Ok(table.len())
    }

    pub fn is_loaded(&self) -> bool {
        self.words.get().is_some()
    }

    pub fn word_count(&self) -> usize {
        self.words.get().map_or(0, HashMap::len)
    }

    pub fn has_word(&self, word: &str) -> bool {
        self.entry(word).is_some()
    }

    pub fn category_for(&self, word: &str) -> Option<&str> {
        self.entry(word).map(|entry| entry.category.as_str())
    }

    /// Clue for `word` at 1-based `clue_number`.
    ///
    /// Numbers past the authored list keep returning the last clue; 0 is
    /// treated as 1.
    pub fn get_clue(&self, word: &str, clue_number: u32) -> Option<ClueResult> {
        let entry = self.entry(word)?;
        let last = entry.clues.len().checked_sub(1)?;
        let index = (clue_number.saturating_sub(1) as usize).min(last);
        let clue = entry.clues.get(index)?;
        Some(ClueResult::fallback(clue.clone()))
    }

    fn entry(&self, word: &str) -> Option<&StaticClueEntry> {
        let key = normalize(word);
        if key.is_empty() {
            return None;
        }
        self.words.get()?.get(&key)
    }
}

fn normalize(word: &str) -> String {
    word.trim().to_lowercase()
}
