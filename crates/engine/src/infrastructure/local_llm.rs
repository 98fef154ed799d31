//! In-process inference backend
//!
//! Runs a model loaded into this process. The native runtime is reached
//! through two seams:
//! - [`ModelLoader`] turns a model file into a [`ModelSession`]
//! - [`ModelSession`] is the execution context that produces tokens
//!
//! A session is not safe for concurrent generation, so it lives inside the
//! backend's generation gate and is only touched by the call holding it.
//! Generation runs on a blocking worker thread; tokens are handed to the
//! caller through a [`TokenStream`]. There is no secondary model: a failed
//! call simply yields no result.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::app_settings::{GenerationOptions, LocalModelParams};
use crate::infrastructure::gate::{CallDeadline, GenerationGate};
use crate::infrastructure::ports::{
    extract_json, ChatMessage, InferenceError, InferencePort, TokenSink, TokenStream,
};

/// Sequences that end a turn; generation stops when one appears and the
/// sequence itself is never emitted.
pub const ANTI_PROMPTS: [&str; 3] = ["User:", "\n\nUser:", "<|eot_id|>"];

/// Appended to the system prompt for JSON-mode chat.
const JSON_INSTRUCTION: &str =
    "\n\nIMPORTANT: Respond with valid JSON only. No markdown, no explanation.";

/// Whether a session should keep producing tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Continue,
    Stop,
}

/// Loads model weights and creates an execution context.
///
/// Called on a blocking worker thread; loading may take seconds.
#[cfg_attr(test, mockall::automock)]
pub trait ModelLoader: Send + Sync {
    fn load(&self, params: &LocalModelParams) -> Result<Box<dyn ModelSession>, InferenceError>;
}

/// A loaded model plus its execution context.
pub trait ModelSession: Send {
    /// Generate a reply to `messages`, handing each token to `on_token`.
    ///
    /// Blocking. Must return promptly once `on_token` answers `Stop`.
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<(), InferenceError>;
}

/// Loader used when no native runtime is linked into the binary.
pub struct UnavailableLoader;

impl ModelLoader for UnavailableLoader {
    fn load(&self, _params: &LocalModelParams) -> Result<Box<dyn ModelSession>, InferenceError> {
        Err(InferenceError::ModelLoad(
            "no native inference runtime is linked into this build".to_string(),
        ))
    }
}

/// Backend running a model inside this process
#[derive(Clone)]
pub struct LocalModelBackend {
    loader: Arc<dyn ModelLoader>,
    params: LocalModelParams,
    options: GenerationOptions,
    timeout: Duration,
    gate: GenerationGate<Option<Box<dyn ModelSession>>>,
    loaded: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
}

impl LocalModelBackend {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        params: LocalModelParams,
        options: GenerationOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            loader,
            params,
            options,
            timeout,
            gate: GenerationGate::new(None),
            loaded: Arc::new(AtomicBool::new(false)),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Load the model. Must complete before any chat call succeeds.
    ///
    /// Returns true when the model is (already) loaded. A missing model file
    /// or a loader failure is logged and reported as false.
    pub async fn load_model(&self, cancel: &CancellationToken) -> bool {
        if self.is_loaded() {
            return true;
        }
        if self.shut_down.load(Ordering::SeqCst) {
            tracing::warn!("Local backend already shut down, refusing to load model");
            return false;
        }

        let path = self.params.model_path();
        if !Path::new(&path).exists() {
            tracing::warn!(path = %path.display(), "Model file not found");
            return false;
        }

        let Some(mut slot) = self.gate.acquire(cancel).await else {
            return false;
        };
        if slot.is_some() {
            self.loaded.store(true, Ordering::SeqCst);
            return true;
        }

        let loader = Arc::clone(&self.loader);
        let params = self.params.clone();
        let load = tokio::task::spawn_blocking(move || loader.load(&params));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("Model load cancelled");
                return false;
            }
            result = load => result,
        };

        match result {
            Ok(Ok(session)) => {
                *slot = Some(session);
                self.loaded.store(true, Ordering::SeqCst);
                tracing::info!(
                    model = %self.params.model_file,
                    context_size = self.params.context_size,
                    gpu_layers = self.params.gpu_layers,
                    "Model loaded"
                );
                true
            }
            Ok(Err(e)) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to load model");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Model load worker panicked");
                false
            }
        }
    }

    /// Drop the model and its execution context, waiting for any in-flight generation.
    pub async fn unload_model(&self) {
        let mut slot = self.gate.acquire_unconditionally().await;
        let had_model = slot.take().is_some();
        self.loaded.store(false, Ordering::SeqCst);
        if had_model {
            tracing::info!(model = %self.params.model_file, "Model unloaded");
        }
    }

    /// Generate into `sink`, holding the gate for the whole generation.
    ///
    /// The gate is released before `sink` is dropped, so a consumer seeing
    /// the end of the stream can immediately start another call. When the
    /// deadline fires first, `sink` is dropped at once and the gate stays
    /// held until the native call returns.
    async fn generate(
        self,
        messages: Vec<ChatMessage>,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> Result<(), InferenceError> {
        if !self.is_loaded() {
            return Err(InferenceError::unavailable("model not loaded"));
        }
        let Some(slot) = self.gate.acquire(&cancel).await else {
            return Err(InferenceError::Cancelled);
        };

        let deadline = CallDeadline::start(&cancel, self.timeout);
        let stop = deadline.token().clone();
        let options = self.options;

        let (worker_sink, mut worker_tokens) = TokenStream::channel();
        let worker = tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            let result = match slot.as_mut() {
                Some(session) => {
                    run_session(&mut **session, &messages, &options, &stop, &worker_sink)
                }
                None => Err(InferenceError::unavailable("model not loaded")),
            };
            drop(slot);
            drop(worker_sink);
            result
        });

        // Relay worker tokens to the caller; ends once the worker has
        // released the gate and dropped its sink.
        let finished = async move {
            while let Some(token) = worker_tokens.next_token().await {
                if !sink.send(token).await {
                    break;
                }
            }
            drop(worker_tokens);
            drop(sink);
            worker.await
        };

        let result = tokio::select! {
            joined = finished => match joined {
                Ok(result) => result,
                Err(e) => Err(InferenceError::RequestFailed(format!(
                    "generation worker panicked: {}",
                    e
                ))),
            },
            _ = deadline.token().cancelled() => return Err(deadline.error()),
        };

        // A session that stopped because the deadline fired reports success;
        // surface the timeout or cancellation instead.
        if result.is_ok() && deadline.is_expired() {
            return Err(deadline.error());
        }
        result
    }
}

#[async_trait]
impl InferencePort for LocalModelBackend {
    fn is_ready(&self) -> bool {
        self.is_loaded() && !self.shut_down.load(Ordering::SeqCst)
    }

    fn stream_chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> TokenStream {
        let (sink, stream) = TokenStream::channel();
        if !self.is_ready() {
            tracing::warn!("Model not loaded, cannot stream");
            return stream;
        }

        let messages = ChatMessage::conversation(system_prompt, user_message);
        let this = self.clone();
        tokio::spawn(async move {
            match this.generate(messages, sink, cancel).await {
                Ok(()) => {}
                Err(e @ (InferenceError::TimedOut(_) | InferenceError::Cancelled)) => {
                    tracing::warn!(error = %e, "Streaming timed out or was cancelled");
                }
                Err(e) => tracing::error!(error = %e, "Streaming error"),
            }
        });
        stream
    }

    async fn chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Option<String> {
        if !self.is_ready() {
            tracing::warn!("Model not loaded, cannot chat");
            return None;
        }

        let (sink, stream) = TokenStream::channel();
        let messages = ChatMessage::conversation(system_prompt, user_message);
        let (result, text) = tokio::join!(
            self.clone().generate(messages, sink, cancel),
            stream.collect_text()
        );

        if let Err(e) = result {
            tracing::warn!(error = %e, "Chat produced no result");
            return None;
        }

        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Option<String> {
        let json_prompt = format!("{}{}", system_prompt, JSON_INSTRUCTION);
        let raw = self.chat(&json_prompt, user_message, cancel).await?;
        Some(extract_json(&raw).to_string())
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unload_model().await;
        tracing::info!("Local backend shut down");
    }
}

/// Drive one session generation, filtering anti-prompts and honouring `stop`.
fn run_session(
    session: &mut dyn ModelSession,
    messages: &[ChatMessage],
    options: &GenerationOptions,
    stop: &CancellationToken,
    sink: &TokenSink,
) -> Result<(), InferenceError> {
    let mut filter = AntiPromptFilter::default();
    let mut consumer_gone = false;

    let result = session.generate(messages, options, &mut |token: &str| {
        if stop.is_cancelled() || consumer_gone {
            return TokenFlow::Stop;
        }
        let (emit, flow) = filter.push(token);
        if !emit.is_empty() && !sink.blocking_send(emit) {
            consumer_gone = true;
            return TokenFlow::Stop;
        }
        flow
    });

    if !consumer_gone && !stop.is_cancelled() {
        let rest = filter.finish();
        if !rest.is_empty() {
            sink.blocking_send(rest);
        }
    }
    result
}

/// Holds back text that could be the start of an anti-prompt.
#[derive(Default)]
struct AntiPromptFilter {
    pending: String,
    stopped: bool,
}

impl AntiPromptFilter {
    /// Feed a token; returns the text safe to emit and whether to continue.
    fn push(&mut self, token: &str) -> (String, TokenFlow) {
        if self.stopped {
            return (String::new(), TokenFlow::Stop);
        }
        self.pending.push_str(token);

        let hit = ANTI_PROMPTS
            .iter()
            .filter_map(|stop| self.pending.find(stop))
            .min();
        if let Some(index) = hit {
            self.stopped = true;
            let emit = self.pending[..index].to_string();
            self.pending.clear();
            return (emit, TokenFlow::Stop);
        }

        let held = ANTI_PROMPTS
            .iter()
            .map(|stop| longest_partial_suffix(&self.pending, stop))
            .max()
            .unwrap_or(0);
        let split = self.pending.len() - held;
        let emit = self.pending[..split].to_string();
        self.pending.drain(..split);
        (emit, TokenFlow::Continue)
    }

    fn finish(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest proper prefix of `stop` that `text` ends with.
fn longest_partial_suffix(text: &str, stop: &str) -> usize {
    (1..stop.len())
        .rev()
        .find(|&len| stop.is_char_boundary(len) && text.ends_with(&stop[..len]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Session that replays scripted tokens, optionally pausing between them.
    struct ScriptedSession {
        tokens: Vec<String>,
        /// Pause before the first token, as for a long prompt evaluation
        warmup: Duration,
        delay: Duration,
        log: Arc<Mutex<Vec<(Instant, Instant)>>>,
        seen_system: Arc<Mutex<Vec<String>>>,
    }

    impl ModelSession for ScriptedSession {
        fn generate(
            &mut self,
            messages: &[ChatMessage],
            _options: &GenerationOptions,
            on_token: &mut dyn FnMut(&str) -> TokenFlow,
        ) -> Result<(), InferenceError> {
            let started = Instant::now();
            if let Some(system) = messages.first() {
                self.seen_system.lock().unwrap().push(system.content.clone());
            }
            std::thread::sleep(self.warmup);
            for token in &self.tokens {
                if !self.delay.is_zero() {
                    std::thread::sleep(self.delay);
                }
                if on_token(token) == TokenFlow::Stop {
                    break;
                }
            }
            self.log.lock().unwrap().push((started, Instant::now()));
            Ok(())
        }
    }

    struct ScriptedLoader {
        tokens: Vec<&'static str>,
        warmup: Duration,
        delay: Duration,
        log: Arc<Mutex<Vec<(Instant, Instant)>>>,
        seen_system: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedLoader {
        fn new(tokens: Vec<&'static str>, delay: Duration) -> Self {
            Self {
                tokens,
                warmup: Duration::ZERO,
                delay,
                log: Arc::new(Mutex::new(Vec::new())),
                seen_system: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ModelLoader for ScriptedLoader {
        fn load(&self, _params: &LocalModelParams) -> Result<Box<dyn ModelSession>, InferenceError> {
            Ok(Box::new(ScriptedSession {
                tokens: self.tokens.iter().map(|t| t.to_string()).collect(),
                warmup: self.warmup,
                delay: self.delay,
                log: Arc::clone(&self.log),
                seen_system: Arc::clone(&self.seen_system),
            }))
        }
    }

    fn params_in(dir: &tempfile::TempDir) -> LocalModelParams {
        let params = LocalModelParams {
            model_dir: dir.path().to_path_buf(),
            ..LocalModelParams::default()
        };
        std::fs::write(params.model_path(), b"gguf").unwrap();
        params
    }

    async fn loaded_backend(
        loader: Arc<dyn ModelLoader>,
        timeout: Duration,
    ) -> (LocalModelBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalModelBackend::new(
            loader,
            params_in(&dir),
            GenerationOptions::default(),
            timeout,
        );
        assert!(backend.load_model(&CancellationToken::new()).await);
        (backend, dir)
    }

    #[tokio::test]
    async fn missing_model_file_leaves_backend_unready() {
        let dir = tempfile::tempdir().unwrap();
        let params = LocalModelParams {
            model_dir: dir.path().to_path_buf(),
            ..LocalModelParams::default()
        };
        let mut loader = MockModelLoader::new();
        loader.expect_load().never();

        let backend = LocalModelBackend::new(
            Arc::new(loader),
            params,
            GenerationOptions::default(),
            Duration::from_secs(5),
        );

        assert!(!backend.load_model(&CancellationToken::new()).await);
        assert!(!backend.is_ready());
        assert_eq!(backend.chat("s", "u", CancellationToken::new()).await, None);
    }

    #[tokio::test]
    async fn loader_failure_leaves_backend_unready() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalModelBackend::new(
            Arc::new(UnavailableLoader),
            params_in(&dir),
            GenerationOptions::default(),
            Duration::from_secs(5),
        );

        assert!(!backend.load_model(&CancellationToken::new()).await);
        assert!(!backend.is_ready());
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = MockModelLoader::new();
        loader.expect_load().times(1).returning(|_| {
            Ok(Box::new(ScriptedSession {
                tokens: vec!["ok".into()],
                warmup: Duration::ZERO,
                delay: Duration::ZERO,
                log: Arc::new(Mutex::new(Vec::new())),
                seen_system: Arc::new(Mutex::new(Vec::new())),
            }))
        });

        let backend = LocalModelBackend::new(
            Arc::new(loader),
            params_in(&dir),
            GenerationOptions::default(),
            Duration::from_secs(5),
        );
        assert!(backend.load_model(&CancellationToken::new()).await);
        assert!(backend.load_model(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn chat_collects_and_trims_tokens() {
        let loader = ScriptedLoader::new(vec!["  It ", "spans ", "a river.  "], Duration::ZERO);
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(5)).await;

        let reply = backend.chat("sys", "user", CancellationToken::new()).await;
        assert_eq!(reply.as_deref(), Some("It spans a river."));
    }

    #[tokio::test]
    async fn stream_delivers_tokens_in_order_then_ends() {
        let loader = ScriptedLoader::new(vec!["one ", "two ", "three"], Duration::ZERO);
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(5)).await;

        let mut stream = backend.stream_chat("sys", "user", CancellationToken::new());
        let mut tokens = Vec::new();
        while let Some(token) = stream.next_token().await {
            tokens.push(token);
        }

        assert_eq!(tokens.concat(), "one two three");
        // Gate is free by the time the stream has ended.
        assert!(!backend.gate.is_busy());
    }

    #[tokio::test]
    async fn anti_prompt_stops_generation_and_is_not_emitted() {
        let loader = ScriptedLoader::new(
            vec!["A span", " of stone.", "\n\nUs", "er:", " ignored"],
            Duration::ZERO,
        );
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(5)).await;

        let reply = backend.chat("sys", "user", CancellationToken::new()).await;
        assert_eq!(reply.as_deref(), Some("A span of stone."));
    }

    #[tokio::test]
    async fn timeout_truncates_stream_and_chat_returns_none() {
        let loader = ScriptedLoader::new(vec!["slow "; 50], Duration::from_millis(20));
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_millis(100)).await;

        let text = backend
            .stream_chat("sys", "user", CancellationToken::new())
            .collect_text()
            .await;
        assert!(text.len() < "slow ".len() * 50);

        assert_eq!(backend.chat("sys", "user", CancellationToken::new()).await, None);
    }

    #[tokio::test]
    async fn session_stalled_before_first_token_times_out_on_schedule() {
        let stalled = || ScriptedLoader {
            warmup: Duration::from_secs(1),
            ..ScriptedLoader::new(vec!["late"], Duration::ZERO)
        };

        let (backend, _dir) = loaded_backend(Arc::new(stalled()), Duration::from_millis(100)).await;
        let started = Instant::now();
        assert_eq!(backend.chat("sys", "user", CancellationToken::new()).await, None);
        assert!(
            started.elapsed() < Duration::from_millis(600),
            "chat took {:?}",
            started.elapsed()
        );

        let (backend, _dir) = loaded_backend(Arc::new(stalled()), Duration::from_millis(100)).await;
        let started = Instant::now();
        let text = backend
            .stream_chat("sys", "user", CancellationToken::new())
            .collect_text()
            .await;
        assert_eq!(text, "");
        assert!(
            started.elapsed() < Duration::from_millis(600),
            "stream took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn cancelled_chat_returns_none() {
        let loader = ScriptedLoader::new(vec!["tick "; 100], Duration::from_millis(10));
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(30)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        assert_eq!(backend.chat("sys", "user", cancel).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chats_never_overlap() {
        let loader = ScriptedLoader::new(vec!["a", "b", "c"], Duration::from_millis(15));
        let log = Arc::clone(&loader.log);
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(5)).await;

        let first = backend.clone();
        let second = backend.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.chat("s", "one", CancellationToken::new()).await }),
            tokio::spawn(async move { second.chat("s", "two", CancellationToken::new()).await }),
        );
        assert_eq!(a.unwrap().as_deref(), Some("abc"));
        assert_eq!(b.unwrap().as_deref(), Some("abc"));

        let mut windows = log.lock().unwrap().clone();
        windows.sort_by_key(|(start, _)| *start);
        assert_eq!(windows.len(), 2);
        assert!(windows[0].1 <= windows[1].0, "generation windows overlapped");
    }

    #[tokio::test]
    async fn chat_json_reinforces_prompt_and_extracts_payload() {
        let loader = ScriptedLoader::new(
            vec!["```json\n", "{\"clue\": \"spans water\"}", "\n```"],
            Duration::ZERO,
        );
        let seen = Arc::clone(&loader.seen_system);
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(5)).await;

        let raw = backend
            .chat_json("Give a clue.", "bridge", CancellationToken::new())
            .await;
        assert_eq!(raw.as_deref(), Some("{\"clue\": \"spans water\"}"));
        assert!(seen.lock().unwrap()[0].ends_with(JSON_INSTRUCTION));
    }

    #[tokio::test]
    async fn shutdown_unloads_once() {
        let loader = ScriptedLoader::new(vec!["x"], Duration::ZERO);
        let (backend, _dir) = loaded_backend(Arc::new(loader), Duration::from_secs(5)).await;

        backend.shutdown().await;
        assert!(!backend.is_ready());
        assert!(!backend.is_loaded());
        backend.shutdown().await;

        let mut stream = backend.stream_chat("s", "u", CancellationToken::new());
        assert_eq!(stream.next_token().await, None);
        assert!(!backend.load_model(&CancellationToken::new()).await);
    }

    #[test]
    fn filter_holds_back_partial_stop_sequence() {
        let mut filter = AntiPromptFilter::default();
        assert_eq!(filter.push("Hello <|eo"), ("Hello ".to_string(), TokenFlow::Continue));
        assert_eq!(filter.push("t_id|> bye"), (String::new(), TokenFlow::Stop));
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn filter_flushes_false_alarm() {
        let mut filter = AntiPromptFilter::default();
        assert_eq!(filter.push("Ask the Us"), ("Ask the ".to_string(), TokenFlow::Continue));
        assert_eq!(filter.push("ual suspect"), ("Usual suspect".to_string(), TokenFlow::Continue));
        assert_eq!(filter.finish(), "");
    }
}
