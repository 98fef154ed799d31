//! Ollama inference backend (native `/api` endpoints)
//!
//! Talks to a local or networked Ollama server. Every call walks the
//! primary -> fallback model chain: a primary-model failure or timeout is
//! retried once against the fallback model before the call gives up.
//! Calls are serialized through a single-flight gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::app_settings::{GenerationOptions, ModelChainConfig};
use crate::infrastructure::gate::{CallDeadline, GenerationGate};
use crate::infrastructure::ports::{
    ChatMessage, InferenceError, InferencePort, ModelAvailability, TokenSink, TokenStream,
};

/// Client for Ollama's chat API with a primary/fallback model chain
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    config: ModelChainConfig,
    gate: GenerationGate<()>,
    available: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
}

/// Outcome of streaming from one model.
enum StreamOutcome {
    /// The `done` fragment arrived, or the body ended cleanly
    Completed,
    /// The consumer dropped the stream
    ConsumerGone,
    /// Stopped early; `delivered` is true if any token reached the consumer
    Failed {
        error: InferenceError,
        delivered: bool,
    },
}

impl OllamaBackend {
    pub fn new(base_url: &str, config: ModelChainConfig) -> Self {
        // Per-call deadlines come from the config; no client-wide timeout.
        let client = Client::builder().build().unwrap_or_else(|_| Client::new());
        Self::with_client(client, base_url, config)
    }

    pub fn with_client(client: Client, base_url: &str, config: ModelChainConfig) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            gate: GenerationGate::new(()),
            available: Arc::new(AtomicBool::new(false)),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ModelChainConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Ask the server which configured models it has pulled.
    ///
    /// Marks the backend ready when either model is present. Any failure
    /// reports both models as missing.
    pub async fn check_models(&self) -> ModelAvailability {
        let availability = match self.fetch_tags().await {
            Ok(tags) => ModelAvailability {
                primary: tags.iter().any(|name| model_matches(name, &self.config.primary_model)),
                fallback: tags
                    .iter()
                    .any(|name| model_matches(name, &self.config.fallback_model)),
            },
            Err(e) => {
                tracing::warn!(base_url = %self.base_url, error = %e, "Could not list Ollama models");
                ModelAvailability::default()
            }
        };

        self.available.store(availability.any(), Ordering::SeqCst);
        tracing::info!(
            primary = %self.config.primary_model,
            primary_available = availability.primary,
            fallback = %self.config.fallback_model,
            fallback_available = availability.fallback,
            "Checked Ollama model availability"
        );
        availability
    }

    async fn fetch_tags(&self) -> Result<Vec<String>, InferenceError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(InferenceError::request_failed)?;

        if !response.status().is_success() {
            return Err(InferenceError::RequestFailed(format!(
                "GET /api/tags returned {}",
                response.status()
            )));
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(InferenceError::invalid_response)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Hint whether `model` should stay resident ("5m") or unload ("0").
    ///
    /// Best-effort: failures are logged at debug level and otherwise ignored.
    pub async fn set_keep_alive(&self, model: &str, keep_alive: &str) {
        let body = KeepAliveRequest { model, keep_alive };
        match self.client.post(self.url("/api/generate")).json(&body).send().await {
            Ok(response) => tracing::debug!(
                model,
                keep_alive,
                status = %response.status(),
                "Sent keep_alive hint"
            ),
            Err(e) => tracing::debug!(model, keep_alive, error = %e, "keep_alive hint failed"),
        }
    }

    async fn chat_with_chain(
        &self,
        system_prompt: &str,
        user_message: &str,
        json_mode: bool,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if self.is_shut_down() {
            return None;
        }
        let _permit = self.gate.acquire(cancel).await?;

        let primary = &self.config.primary_model;
        match self
            .try_chat_model(primary, system_prompt, user_message, json_mode, cancel)
            .await
        {
            Ok(content) => return Some(content),
            Err(e) if e.is_cancelled() => {
                tracing::debug!(model = %primary, "Chat cancelled by caller");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    model = %primary,
                    fallback = %self.config.fallback_model,
                    error = %e,
                    "Primary model failed, retrying with fallback"
                );
            }
        }

        let fallback = &self.config.fallback_model;
        match self
            .try_chat_model(fallback, system_prompt, user_message, json_mode, cancel)
            .await
        {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::warn!(model = %fallback, error = %e, "Fallback model failed");
                None
            }
        }
    }

    async fn try_chat_model(
        &self,
        model: &str,
        system_prompt: &str,
        user_message: &str,
        json_mode: bool,
        cancel: &CancellationToken,
    ) -> Result<String, InferenceError> {
        let request = build_request(
            model,
            system_prompt,
            user_message,
            false,
            json_mode,
            self.config.options,
        );
        let deadline = CallDeadline::start(cancel, self.config.timeout());

        deadline
            .run(async {
                let response = self
                    .client
                    .post(self.url("/api/chat"))
                    .json(&request)
                    .send()
                    .await
                    .map_err(InferenceError::request_failed)?;

                if !response.status().is_success() {
                    let status = response.status();
                    let error_text = response.text().await.unwrap_or_default();
                    return Err(InferenceError::RequestFailed(format!(
                        "{}: {}",
                        status, error_text
                    )));
                }

                let body: OllamaChatResponse = response
                    .json()
                    .await
                    .map_err(InferenceError::invalid_response)?;

                body.message
                    .map(|m| m.content)
                    .filter(|content| !content.trim().is_empty())
                    .ok_or_else(|| InferenceError::invalid_response("Empty message content"))
            })
            .await
    }

    async fn stream_with_chain(
        self,
        system_prompt: String,
        user_message: String,
        sink: TokenSink,
        cancel: CancellationToken,
    ) {
        if self.is_shut_down() {
            return;
        }
        let Some(permit) = self.gate.acquire(&cancel).await else {
            return;
        };

        let primary = self.config.primary_model.clone();
        let outcome = self
            .try_stream_model(&primary, &system_prompt, &user_message, &sink, &cancel)
            .await;

        if let StreamOutcome::Failed { error, delivered } = outcome {
            if error.is_cancelled() || delivered {
                // Truncated: the consumer already has part of this answer.
                tracing::warn!(model = %primary, error = %error, "Stream ended early");
            } else {
                tracing::warn!(
                    model = %primary,
                    fallback = %self.config.fallback_model,
                    error = %error,
                    "Primary model stream failed, retrying with fallback"
                );
                let fallback = self.config.fallback_model.clone();
                if let StreamOutcome::Failed { error, .. } = self
                    .try_stream_model(&fallback, &system_prompt, &user_message, &sink, &cancel)
                    .await
                {
                    tracing::warn!(model = %fallback, error = %error, "Fallback model stream failed");
                }
            }
        }

        // Release the gate before the consumer sees the end of the stream.
        drop(permit);
        drop(sink);
    }

    async fn try_stream_model(
        &self,
        model: &str,
        system_prompt: &str,
        user_message: &str,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let request = build_request(
            model,
            system_prompt,
            user_message,
            true,
            false,
            self.config.options,
        );
        let deadline = CallDeadline::start(cancel, self.config.timeout());
        let mut delivered = false;

        let result = deadline
            .run(async {
                let response = self
                    .client
                    .post(self.url("/api/chat"))
                    .json(&request)
                    .send()
                    .await
                    .map_err(InferenceError::request_failed)?;

                if !response.status().is_success() {
                    return Err(InferenceError::RequestFailed(format!(
                        "POST /api/chat returned {}",
                        response.status()
                    )));
                }

                let mut body = response.bytes_stream();
                let mut lines = NdjsonLines::default();

                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(InferenceError::request_failed)?;
                    for line in lines.push(&chunk) {
                        match handle_fragment(&line, sink, &mut delivered).await? {
                            FragmentFlow::Continue => {}
                            FragmentFlow::Done => return Ok(StreamOutcome::Completed),
                            FragmentFlow::ConsumerGone => return Ok(StreamOutcome::ConsumerGone),
                        }
                    }
                }

                if let Some(line) = lines.finish() {
                    if let FragmentFlow::ConsumerGone =
                        handle_fragment(&line, sink, &mut delivered).await?
                    {
                        return Ok(StreamOutcome::ConsumerGone);
                    }
                }
                Ok(StreamOutcome::Completed)
            })
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(error) => StreamOutcome::Failed { error, delivered },
        }
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(
            crate::infrastructure::app_settings::DEFAULT_OLLAMA_BASE_URL,
            ModelChainConfig::default(),
        )
    }
}

#[async_trait]
impl InferencePort for OllamaBackend {
    fn is_ready(&self) -> bool {
        !self.is_shut_down() && self.available.load(Ordering::SeqCst)
    }

    fn stream_chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> TokenStream {
        let (sink, stream) = TokenStream::channel();
        let this = self.clone();
        let system_prompt = system_prompt.to_string();
        let user_message = user_message.to_string();
        tokio::spawn(async move {
            this.stream_with_chain(system_prompt, user_message, sink, cancel)
                .await;
        });
        stream
    }

    async fn chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Option<String> {
        self.chat_with_chain(system_prompt, user_message, false, &cancel)
            .await
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Option<String> {
        self.chat_with_chain(system_prompt, user_message, true, &cancel)
            .await
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wait out any in-flight call so nothing uses the client afterwards.
        let _idle = self.gate.acquire_unconditionally().await;
        self.available.store(false, Ordering::SeqCst);
        tracing::info!(base_url = %self.base_url, "Ollama backend shut down");
    }
}

/// Exact tag match, or a bare model name matching any of its tags.
fn model_matches(name: &str, model: &str) -> bool {
    name == model
        || name
            .strip_prefix(model)
            .is_some_and(|rest| rest.starts_with(':'))
}

fn build_request<'a>(
    model: &'a str,
    system_prompt: &'a str,
    user_message: &'a str,
    stream: bool,
    json_mode: bool,
    options: GenerationOptions,
) -> OllamaChatRequest<'a> {
    let messages = ChatMessage::conversation(system_prompt, user_message)
        .into_iter()
        .map(|msg| OllamaMessage {
            role: msg.role.as_str(),
            content: msg.content,
        })
        .collect();

    OllamaChatRequest {
        model,
        messages,
        stream,
        options: OllamaOptions {
            temperature: options.temperature,
            num_predict: options.max_tokens,
        },
        format: json_mode.then_some("json"),
    }
}

enum FragmentFlow {
    Continue,
    Done,
    ConsumerGone,
}

/// Forward the text of one NDJSON fragment to the consumer.
async fn handle_fragment(
    line: &str,
    sink: &TokenSink,
    delivered: &mut bool,
) -> Result<FragmentFlow, InferenceError> {
    let fragment: OllamaChatResponse =
        serde_json::from_str(line).map_err(InferenceError::invalid_response)?;

    if let Some(message) = fragment.message {
        if !message.content.is_empty() {
            if !sink.send(message.content).await {
                return Ok(FragmentFlow::ConsumerGone);
            }
            *delivered = true;
        }
    }

    if fragment.done {
        Ok(FragmentFlow::Done)
    } else {
        Ok(FragmentFlow::Continue)
    }
}

/// Splits a chunked byte stream into complete newline-terminated lines.
#[derive(Default)]
struct NdjsonLines {
    buffer: Vec<u8>,
}

impl NdjsonLines {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

// =============================================================================
// Ollama API types
// =============================================================================

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct KeepAliveRequest<'a> {
    model: &'a str,
    keep_alive: &'a str,
}
