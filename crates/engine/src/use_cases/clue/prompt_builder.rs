//! Prompt building for clue requests
//!
//! Produces the (system prompt, user message) pair sent to the inference
//! backend. Pure string assembly: the section order below is part of the
//! contract with the model and with tests.

use spellwright_domain::{AssembledPrompt, PromptContext};

/// Literal response-format example; weaker models pattern-match on it.
pub const RESPONSE_FORMAT_EXAMPLE: &str =
    "{\"clue\": \"your clue text\", \"mood\": \"neutral|amused|cryptic|frustrated|excited\"}";

/// Build the prompt pair for one clue request.
pub fn build_clue_prompt(context: &PromptContext) -> AssembledPrompt {
    AssembledPrompt {
        system_prompt: build_system_prompt(context),
        user_message: build_user_message(context),
    }
}

/// Build the system prompt establishing the NPC, the rules and the reply format
pub fn build_system_prompt(context: &PromptContext) -> String {
    let npc = &context.npc;
    let mut prompt = String::new();

    // Identity
    prompt.push_str(&format!(
        "You are {}, a {} in a magical word-guessing game.\n\n",
        npc.display_name, npc.archetype
    ));

    // Personality
    if !npc.personality_template.is_empty() {
        let personalized = npc
            .personality_template
            .replace("{displayName}", &npc.display_name)
            .replace("{archetype}", npc.archetype.display_name())
            .replace("{category}", &context.category)
            .replace("{clueNumber}", &context.clue_index.to_string());
        prompt.push_str(&personalized);
        prompt.push_str("\n\n");
    }

    // Rules
    prompt.push_str("RULES:\n");
    prompt.push_str("- The player is trying to guess a secret word. You give clues.\n");
    prompt.push_str("- NEVER say the word directly. NEVER use the word in your clue.\n");
    prompt.push_str("- NEVER use a word that contains the secret word as a substring.\n");
    prompt.push_str("- Your clue should be 1-2 sentences maximum.\n");
    prompt.push_str(&format!("- The word category is \"{}\".\n", context.category));
    prompt.push_str(&format!(
        "- This is clue #{}. Each clue should be MORE specific than the last.\n",
        context.clue_index
    ));

    if let Some(constraint) = npc.active_boss_constraint() {
        prompt.push_str(&format!("- BOSS CONSTRAINT: {}\n", constraint));
    }

    if !context.active_modifiers.is_empty() {
        prompt.push_str("\nACTIVE MODIFIERS:\n");
        for modifier in &context.active_modifiers {
            prompt.push_str(&format!("- {}\n", modifier));
        }
    }

    // Response format
    prompt.push_str("\nRespond in JSON format:\n");
    prompt.push_str(RESPONSE_FORMAT_EXAMPLE);
    prompt.push('\n');

    prompt
}

/// Build the user message naming the word, its shape and the wrong guesses so far
pub fn build_user_message(context: &PromptContext) -> String {
    let mut message = format!(
        "The secret word is \"{}\" (category: {}, {} letters).\n",
        context.target_word,
        context.category,
        context.letter_count()
    );

    if !context.previous_guesses.is_empty() {
        let guesses: Vec<String> = context
            .previous_guesses
            .iter()
            .map(|guess| format!("\"{}\" (wrong)", guess))
            .collect();
        message.push_str(&format!("The player has guessed: {}\n", guesses.join(", ")));
    }

    message.push_str(&format!(
        "Give clue #{}. Remember: more specific than previous clues.\n",
        context.clue_index
    ));

    message
}
