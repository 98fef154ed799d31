//! Clue response parser.
//!
//! Turns raw model output into a clue. Strategies are tried in order and the
//! first one producing a clue wins:
//! 1. strict JSON (`{"clue": ..., "mood": ...}`, optionally fenced)
//! 2. regex extraction of the `"clue"` / `"mood"` fields from malformed JSON
//! 3. the first one or two sentences of the text
//!
//! The word-leak check runs last, on the parsed clue only.

use regex_lite::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use spellwright_domain::{ClueMood, ClueResult};

static CLUE_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"clue"\s*:\s*"([^"]+)""#).expect("valid regex"));
static MOOD_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"mood"\s*:\s*"([^"]+)""#).expect("valid regex"));

/// Sentence terminators for the last-resort strategy
const SENTENCE_ENDS: [char; 3] = ['.', '!', '?'];

/// A clue candidate before the leak check
#[derive(Debug, Clone, PartialEq)]
struct ParsedClue {
    clue: String,
    mood: ClueMood,
}

#[derive(Debug, Deserialize)]
struct RawClueJson {
    #[serde(default)]
    clue: Option<String>,
    #[serde(default)]
    mood: Option<String>,
}

type Strategy = fn(&str) -> Option<ParsedClue>;

const STRATEGIES: [Strategy; 3] = [parse_json, parse_fields, parse_sentences];

/// Parse raw model output into a clue.
///
/// Returns `None` for blank input, or when `target_word` is given and the
/// clue contains it as a whole word (case-insensitive).
pub fn parse_clue(raw: &str, target_word: Option<&str>) -> Option<ClueResult> {
    if raw.trim().is_empty() {
        return None;
    }

    let parsed = STRATEGIES.iter().find_map(|strategy| strategy(raw))?;

    if let Some(target) = target_word {
        if contains_whole_word(&parsed.clue, target) {
            tracing::debug!(clue = %parsed.clue, "Rejected clue revealing the secret word");
            return None;
        }
    }

    Some(ClueResult::generated(parsed.clue, parsed.mood))
}

/// Whether `text` contains `word` as a standalone word, ignoring case.
///
/// A blank `word` never matches; "bridge" does not match "abridged".
/// Case folding and word boundaries are Unicode-aware.
pub fn contains_whole_word(text: &str, word: &str) -> bool {
    let word = word.trim();
    if word.is_empty() || text.is_empty() {
        return false;
    }

    let pattern = format!(r"\b{}\b", regex::escape(word));
    match regex::RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .unicode(true)
        .build()
    {
        Ok(re) => re.is_match(text),
        Err(_) => text.to_lowercase().contains(&word.to_lowercase()),
    }
}

// =============================================================================
// Strategies
// =============================================================================

fn parse_json(raw: &str) -> Option<ParsedClue> {
    let cleaned = strip_code_fence(raw);

    // Whole payload first, then the outermost braces inside surrounding prose.
    let candidates = [Some(cleaned), brace_span(cleaned)];
    candidates
        .into_iter()
        .flatten()
        .filter_map(|candidate| serde_json::from_str::<RawClueJson>(candidate).ok())
        .find_map(|json| {
            let clue = json.clue?.trim().to_string();
            if clue.is_empty() {
                return None;
            }
            Some(ParsedClue {
                clue,
                mood: ClueMood::parse(json.mood.as_deref().unwrap_or_default()),
            })
        })
}

fn parse_fields(raw: &str) -> Option<ParsedClue> {
    let clue = CLUE_FIELD_RE.captures(raw)?.get(1)?.as_str().trim();
    if clue.is_empty() {
        return None;
    }

    let mood = MOOD_FIELD_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| ClueMood::parse(m.as_str()))
        .unwrap_or_default();

    Some(ParsedClue {
        clue: clue.to_string(),
        mood,
    })
}

fn parse_sentences(raw: &str) -> Option<ParsedClue> {
    let mut sentences: Vec<String> = Vec::with_capacity(2);
    let mut start = 0;

    for (index, ch) in raw.char_indices() {
        if !SENTENCE_ENDS.contains(&ch) {
            continue;
        }
        let body = raw[start..index].trim();
        if !body.is_empty() {
            sentences.push(format!("{}{}", body, ch));
        }
        start = index + ch.len_utf8();
        if sentences.len() == 2 {
            break;
        }
    }

    if sentences.len() < 2 {
        let tail = raw[start..].trim();
        if !tail.is_empty() {
            sentences.push(format!("{}.", tail));
        }
    }

    let clue = if sentences.is_empty() {
        // Only punctuation, e.g. "..."
        raw.trim().to_string()
    } else {
        sentences.join(" ")
    };

    (!clue.is_empty()).then_some(ParsedClue {
        clue,
        mood: ClueMood::Neutral,
    })
}

// =============================================================================
// Helpers
// =============================================================================

/// Remove a surrounding markdown code fence (```` ```json ... ``` ````).
fn strip_code_fence(raw: &str) -> &str {
    let mut cleaned = raw.trim();
    if cleaned.starts_with("```") {
        if let Some(newline) = cleaned.find('\n') {
            cleaned = &cleaned[newline + 1..];
        }
        if let Some(stripped) = cleaned.strip_suffix("```") {
            cleaned = stripped;
        }
        cleaned = cleaned.trim();
    }
    cleaned
}

fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clue_of(raw: &str) -> String {
        parse_clue(raw, None).map(|r| r.clue_text).unwrap_or_default()
    }

    #[test]
    fn test_parse_plain_json() {
        let result = parse_clue(
            r#"{"clue": "  It carries travelers over water.  ", "mood": "cryptic"}"#,
            Some("bridge"),
        )
        .unwrap();

        assert_eq!(result.clue_text, "It carries travelers over water.");
        assert_eq!(result.mood, ClueMood::Cryptic);
        assert!(!result.used_fallback);
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "```json\n{\"clue\": \"Spans a river.\", \"mood\": \"amused\"}\n```";
        let result = parse_clue(raw, None).unwrap();
        assert_eq!(result.clue_text, "Spans a river.");
        assert_eq!(result.mood, ClueMood::Amused);
    }

    #[test]
    fn test_parse_json_surrounded_by_prose() {
        let raw = "Here is my clue:\n{\"clue\": \"Trolls live \\\"under\\\" it.\", \"mood\": \"excited\"}\nGood luck!";
        let result = parse_clue(raw, None).unwrap();
        assert_eq!(result.clue_text, "Trolls live \"under\" it.");
        assert_eq!(result.mood, ClueMood::Excited);
    }

    #[test]
    fn test_parse_malformed_json_with_regex() {
        let raw = r#"{"Clue": "Arches over a gorge", "MOOD": "frustrated",}"#;
        let result = parse_clue(raw, None).unwrap();
        assert_eq!(result.clue_text, "Arches over a gorge");
        assert_eq!(result.mood, ClueMood::Frustrated);
    }

    #[test]
    fn test_blank_json_clue_falls_through() {
        // Blank clue field: neither structured tier accepts it.
        let result = parse_clue(r#"{"clue": "   ", "mood": "amused"}"#, None).unwrap();
        assert_eq!(result.mood, ClueMood::Neutral);
    }

    #[test]
    fn test_sentence_fallback_takes_two_sentences() {
        assert_eq!(
            clue_of("It spans a gap! Cars drive across it. Some are famous."),
            "It spans a gap! Cars drive across it."
        );
    }

    #[test]
    fn test_sentence_fallback_single_and_unterminated() {
        assert_eq!(clue_of("Often made of stone"), "Often made of stone.");
        assert_eq!(clue_of("Look up? It connects towns"), "Look up? It connects towns.");
        assert_eq!(clue_of("...Hmm..."), "Hmm.");
        assert_eq!(clue_of("?!"), "?!");
    }

    #[test]
    fn test_blank_input_yields_nothing() {
        assert!(parse_clue("", None).is_none());
        assert!(parse_clue("   \n\t ", Some("bridge")).is_none());
    }

    #[test]
    fn test_mood_defaults_to_neutral_in_every_tier() {
        let json = parse_clue(r#"{"clue": "Over water"}"#, None).unwrap();
        let fields = parse_clue(r#"{"clue": "Over water" oops"#, None).unwrap();
        let sentences = parse_clue("Over water.", None).unwrap();

        assert_eq!(json.mood, ClueMood::Neutral);
        assert_eq!(fields.mood, ClueMood::Neutral);
        assert_eq!(sentences.mood, ClueMood::Neutral);
    }

    #[test]
    fn test_unknown_mood_is_kept() {
        let result = parse_clue(r#"{"clue": "Over water", "mood": " smug "}"#, None).unwrap();
        assert_eq!(result.mood, ClueMood::Other("smug".to_string()));
    }

    #[test]
    fn test_leak_rejected_as_whole_word_any_case() {
        assert!(parse_clue(r#"{"clue": "Look at that BRIDGE!"}"#, Some("bridge")).is_none());
        assert!(parse_clue("Look at that bridge. Nice.", Some("Bridge")).is_none());
    }

    #[test]
    fn test_substring_of_longer_word_is_not_a_leak() {
        let result = parse_clue(r#"{"clue": "Abridged versions tell less."}"#, Some("bridge"));
        assert_eq!(result.unwrap().clue_text, "Abridged versions tell less.");
    }

    #[test]
    fn test_leak_check_folds_non_ascii_case() {
        assert!(parse_clue(r#"{"clue": "Bite into an ÉCLAIR today."}"#, Some("éclair")).is_none());
        assert!(contains_whole_word("Ask the ÖLMÜHLE keeper", "ölmühle"));
    }

    #[test]
    fn test_non_ascii_word_inside_longer_word_is_not_a_leak() {
        let result = parse_clue(r#"{"clue": "Cafés line the square."}"#, Some("café"));
        assert_eq!(result.unwrap().clue_text, "Cafés line the square.");
        assert!(!contains_whole_word("naïveté", "naïve"));
        assert!(contains_whole_word("so naïve, really", "NAÏVE"));
    }

    #[test]
    fn test_blank_target_skips_leak_check() {
        assert!(parse_clue(r#"{"clue": "A bridge"}"#, Some("  ")).is_some());
    }

    #[test]
    fn test_leak_check_ignores_stripped_wrapper() {
        // Only the parsed clue is checked, not the fence info string.
        let raw = "```bridge\n{\"clue\": \"Crosses a river\"}\n```";
        assert_eq!(
            parse_clue(raw, Some("bridge")).unwrap().clue_text,
            "Crosses a river"
        );
    }

    #[test]
    fn test_contains_whole_word_escapes_target() {
        assert!(contains_whole_word("is c.at here", "c.at"));
        assert!(!contains_whole_word("is cxat here", "c.at"));
    }
}
