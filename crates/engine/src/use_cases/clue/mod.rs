//! Clue generation use case.
//!
//! `ClueOrchestrator` always produces a clue, degrading through three sources:
//! 1. the language model (prompt -> chat -> parse + leak check)
//! 2. the static fallback store
//! 3. a generic clue built from the category and word length
//!
//! It also exposes raw streaming and JSON-mode chat for free-form NPC talk;
//! those go straight to the model with no fallback.

pub mod prompt_builder;
pub mod response_parser;

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use spellwright_domain::{ClueResult, PromptContext};

use crate::infrastructure::ports::{self, InferencePort, TokenStream};
use crate::stores::StaticFallbackStore;

pub use prompt_builder::build_clue_prompt;
pub use response_parser::parse_clue;

/// Clue source combining the model, the static store and a generic fallback
pub struct ClueOrchestrator {
    backend: Arc<dyn InferencePort>,
    fallback: Arc<StaticFallbackStore>,
    shutdown: CancellationToken,
}

impl ClueOrchestrator {
    pub fn new(backend: Arc<dyn InferencePort>, fallback: Arc<StaticFallbackStore>) -> Self {
        Self {
            backend,
            fallback,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether the model can serve requests.
    pub fn is_model_loaded(&self) -> bool {
        self.backend.is_ready()
    }

    pub fn is_fallback_available(&self) -> bool {
        self.fallback.is_loaded()
    }

    /// Whether at least one real clue source (model or static store) is ready.
    pub fn is_ready(&self) -> bool {
        self.is_model_loaded() || self.is_fallback_available()
    }

    /// Produce a clue for `context`. Never fails and never returns empty text.
    pub async fn generate_clue(&self, context: &PromptContext) -> ClueResult {
        if self.is_model_loaded() {
            if let Some(clue) = self.try_model_clue(context).await {
                return clue;
            }
            tracing::warn!(
                clue_index = context.clue_index,
                "Model clue generation failed, trying fallback clues"
            );
        }

        if let Some(clue) = self
            .fallback
            .get_clue(&context.target_word, context.clue_index)
        {
            tracing::info!(clue_index = context.clue_index, "Using fallback clue");
            return clue;
        }

        tracing::warn!(
            category = %context.category,
            "No clue source available, using generic clue"
        );
        generic_clue(context)
    }

    async fn try_model_clue(&self, context: &PromptContext) -> Option<ClueResult> {
        let prompt = build_clue_prompt(context);

        let started = Instant::now();
        let raw = self
            .backend
            .chat(
                &prompt.system_prompt,
                &prompt.user_message,
                self.shutdown.child_token(),
            )
            .await?;
        let elapsed = started.elapsed();

        let Some(mut clue) = parse_clue(&raw, Some(&context.target_word)) else {
            tracing::warn!(raw = %raw, "Model response was unusable or revealed the word");
            return None;
        };

        clue.used_fallback = false;
        clue.generation_time_ms = elapsed.as_secs_f32() * 1000.0;
        tracing::debug!(
            generation_time_ms = clue.generation_time_ms,
            mood = %clue.mood,
            "Generated clue"
        );
        Some(clue)
    }

    /// Stream a free-form chat from the model.
    ///
    /// When the model is not ready the returned stream is already finished.
    pub fn stream_chat(&self, system_prompt: &str, user_message: &str) -> TokenStream {
        if !self.is_model_loaded() {
            tracing::warn!("Cannot stream, model not loaded");
            return TokenStream::empty();
        }
        self.backend
            .stream_chat(system_prompt, user_message, self.shutdown.child_token())
    }

    /// Callback form of [`Self::stream_chat`]: `on_token` per token in order,
    /// then `on_done` exactly once.
    pub async fn stream_chat_with<F, D>(
        &self,
        system_prompt: &str,
        user_message: &str,
        mut on_token: F,
        on_done: D,
    ) where
        F: FnMut(String),
        D: FnOnce(),
    {
        let mut stream = self.stream_chat(system_prompt, user_message);
        while let Some(token) = stream.next_token().await {
            on_token(token);
        }
        on_done();
    }

    /// JSON-mode chat deserialized into `T`. Model only; `None` when unready.
    pub async fn chat_structured<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Option<T> {
        if !self.is_model_loaded() {
            tracing::warn!("Cannot use JSON mode, model not loaded");
            return None;
        }
        ports::chat_structured(
            self.backend.as_ref(),
            system_prompt,
            user_message,
            self.shutdown.child_token(),
        )
        .await
    }

    /// Cancel outstanding calls and release the backend.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.backend.shutdown().await;
    }
}

/// Last-resort clue built from the category and word length.
pub fn generic_clue(context: &PromptContext) -> ClueResult {
    ClueResult::fallback(format!(
        "Think about the category \"{}\" — the answer has {} letters.",
        context.category,
        context.letter_count()
    ))
}
