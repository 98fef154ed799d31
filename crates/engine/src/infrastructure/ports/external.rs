//! Inference backend port and the types that travel across it.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the channel between a generating backend and its consumer.
const TOKEN_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Chat Types
// =============================================================================

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// System + user pair; the system message is skipped when empty.
    pub fn conversation(system_prompt: &str, user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.push(ChatMessage::user(user_message));
        messages
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// Which of the configured models a backend can serve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelAvailability {
    pub primary: bool,
    pub fallback: bool,
}

impl ModelAvailability {
    pub fn any(&self) -> bool {
        self.primary || self.fallback
    }
}

// =============================================================================
// Token Streaming
// =============================================================================

/// Producer half of a token stream.
///
/// Dropping the sink ends the stream, which is how "done" is signalled.
#[derive(Debug)]
pub struct TokenSink {
    tx: mpsc::Sender<String>,
}

impl TokenSink {
    /// Send a token from async code. Returns false once the consumer is gone.
    pub async fn send(&self, token: impl Into<String>) -> bool {
        self.tx.send(token.into()).await.is_ok()
    }

    /// Send a token from a blocking worker thread.
    pub fn blocking_send(&self, token: impl Into<String>) -> bool {
        self.tx.blocking_send(token.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a token stream.
///
/// Tokens arrive in generation order. The stream yields `None` exactly when
/// generation has finished (completed, timed out, cancelled or failed) and
/// the backend has released its generation gate.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<String>,
}

impl TokenStream {
    pub fn channel() -> (TokenSink, TokenStream) {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        (TokenSink { tx }, TokenStream { rx })
    }

    /// A stream that is already finished.
    pub fn empty() -> Self {
        let (_sink, stream) = Self::channel();
        stream
    }

    pub async fn next_token(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(token) = self.rx.recv().await {
            text.push_str(&token);
        }
        text
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Inference Port
// =============================================================================

/// Streaming and one-shot chat against a language model.
///
/// Implementations serialize generation through a single-flight gate and
/// never surface errors: failures, timeouts and cancellation all come back
/// as `None` or as a stream that ends early.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferencePort: Send + Sync {
    /// Whether the backend can currently serve chat calls.
    fn is_ready(&self) -> bool;

    /// Start a streamed chat. Must be called from within a Tokio runtime.
    fn stream_chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> TokenStream;

    /// One-shot chat returning the full response text.
    async fn chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Option<String>;

    /// One-shot chat asking the model for JSON output.
    ///
    /// Returns the raw JSON text; see [`chat_structured`] for typed access.
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Option<String>;

    /// Release model / client resources. Calling it twice is a no-op.
    async fn shutdown(&self);
}

/// JSON-mode chat deserialized into `T`. `None` on any failure.
pub async fn chat_structured<T: DeserializeOwned>(
    backend: &dyn InferencePort,
    system_prompt: &str,
    user_message: &str,
    cancel: CancellationToken,
) -> Option<T> {
    let raw = backend.chat_json(system_prompt, user_message, cancel).await?;
    let json = extract_json(&raw);
    match serde_json::from_str::<T>(json) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, raw = %raw, "Structured chat response did not deserialize");
            None
        }
    }
}

/// Pull the JSON payload out of a model response.
///
/// Strips a surrounding markdown code fence, then narrows to the span from
/// the first `{`/`[` to the last `}`/`]`. Returns the trimmed input when no
/// such span exists.
pub fn extract_json(raw: &str) -> &str {
    let mut text = raw.trim();

    if text.starts_with("```") {
        if let Some(newline) = text.find('\n') {
            text = &text[newline + 1..];
        }
        if let Some(stripped) = text.trim_end().strip_suffix("```") {
            text = stripped;
        }
        text = text.trim();
    }

    let start = text.find(['{', '[']);
    let end = text.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn extract_json_strips_fence_and_prose() {
        let raw = "```json\n{\"clue\": \"x\"}\n```";
        assert_eq!(extract_json(raw), "{\"clue\": \"x\"}");

        let raw = "Sure! Here you go: {\"a\": [1, 2]} Hope that helps.";
        assert_eq!(extract_json(raw), "{\"a\": [1, 2]}");
    }

    #[test]
    fn extract_json_passes_through_plain_text() {
        assert_eq!(extract_json("  no json here "), "no json here");
    }

    #[test]
    fn conversation_skips_empty_system_prompt() {
        let messages = ChatMessage::conversation("", "hello");
        assert_eq!(messages, vec![ChatMessage::user("hello")]);

        let messages = ChatMessage::conversation("be terse", "hello");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn token_stream_preserves_order_and_ends_on_drop() {
        let (sink, stream) = TokenStream::channel();
        tokio::spawn(async move {
            for token in ["A ", "bridge ", "of ", "words"] {
                assert!(sink.send(token).await);
            }
        });

        let tokens: Vec<String> = stream.collect().await;
        assert_eq!(tokens, vec!["A ", "bridge ", "of ", "words"]);
    }

    #[tokio::test]
    async fn empty_stream_is_already_done() {
        let mut stream = TokenStream::empty();
        assert_eq!(stream.next_token().await, None);
    }

    #[tokio::test]
    async fn chat_structured_deserializes_json_reply() {
        #[derive(serde::Deserialize)]
        struct Reply {
            clue: String,
        }

        let mut backend = MockInferencePort::new();
        backend
            .expect_chat_json()
            .returning(|_, _, _| Some("```json\n{\"clue\": \"spans water\"}\n```".to_string()));

        let reply: Option<Reply> =
            chat_structured(&backend, "sys", "user", CancellationToken::new()).await;
        assert_eq!(reply.map(|r| r.clue), Some("spans water".to_string()));
    }

    #[tokio::test]
    async fn chat_structured_returns_none_for_garbage() {
        let mut backend = MockInferencePort::new();
        backend
            .expect_chat_json()
            .returning(|_, _, _| Some("not json at all".to_string()));

        let reply: Option<serde_json::Value> =
            chat_structured(&backend, "sys", "user", CancellationToken::new()).await;
        assert!(reply.is_none());
    }
}
