//! Application state and composition.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::infrastructure::{
    app_settings::{AppSettings, BackendKind},
    local_llm::{LocalModelBackend, ModelLoader, UnavailableLoader},
    ollama::OllamaBackend,
    ports::InferencePort,
};
use crate::stores::StaticFallbackStore;
use crate::use_cases::ClueOrchestrator;

/// Main application state.
///
/// Owns the inference backend, the fallback clue table and the clue
/// orchestrator built on top of them. Call [`App::shutdown`] once when done.
pub struct App {
    pub backend: Arc<dyn InferencePort>,
    pub fallback: Arc<StaticFallbackStore>,
    pub clues: Arc<ClueOrchestrator>,
}

impl App {
    /// Create a new App from already-built parts.
    pub fn new(backend: Arc<dyn InferencePort>, fallback: Arc<StaticFallbackStore>) -> Self {
        let clues = Arc::new(ClueOrchestrator::new(backend.clone(), fallback.clone()));
        Self {
            backend,
            fallback,
            clues,
        }
    }

    /// Build the pipeline described by `settings`.
    ///
    /// The in-process backend gets a loader with no native runtime; use
    /// [`App::build_with_loader`] to supply one.
    pub async fn build(settings: &AppSettings) -> Self {
        Self::build_with_loader(settings, Arc::new(UnavailableLoader)).await
    }

    pub async fn build_with_loader(settings: &AppSettings, loader: Arc<dyn ModelLoader>) -> Self {
        let fallback = Arc::new(load_fallback_clues(settings));

        let backend: Arc<dyn InferencePort> = match settings.backend {
            BackendKind::Ollama => Arc::new(connect_ollama(settings).await),
            BackendKind::Local => Arc::new(load_local(settings, loader).await),
        };

        let app = Self::new(backend, fallback);
        tracing::info!(
            backend = %settings.backend,
            model_ready = app.clues.is_model_loaded(),
            fallback_words = app.fallback.word_count(),
            "Clue pipeline ready"
        );
        app
    }

    /// Cancel outstanding calls and release backend resources.
    pub async fn shutdown(&self) {
        self.clues.shutdown().await;
    }
}

fn load_fallback_clues(settings: &AppSettings) -> StaticFallbackStore {
    let Some(path) = &settings.fallback_clues_path else {
        return StaticFallbackStore::bundled();
    };

    let store = StaticFallbackStore::new();
    if let Err(e) = store.load_from_path(path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "Could not load fallback clue file, using bundled clues"
        );
        return StaticFallbackStore::bundled();
    }
    store
}

async fn connect_ollama(settings: &AppSettings) -> OllamaBackend {
    tracing::info!(base_url = %settings.ollama_base_url, "Connecting to Ollama");
    let backend = OllamaBackend::new(&settings.ollama_base_url, settings.models.clone());

    let availability = backend.check_models().await;
    if !availability.any() {
        tracing::warn!("No configured Ollama model is available. Using fallback clues only.");
    }

    if let Some(keep_alive) = &settings.keep_alive {
        let model = if availability.primary {
            Some(&settings.models.primary_model)
        } else if availability.fallback {
            Some(&settings.models.fallback_model)
        } else {
            None
        };
        if let Some(model) = model {
            backend.set_keep_alive(model, keep_alive).await;
        }
    }

    backend
}

async fn load_local(settings: &AppSettings, loader: Arc<dyn ModelLoader>) -> LocalModelBackend {
    let backend = LocalModelBackend::new(
        loader,
        settings.local.clone(),
        settings.models.options,
        settings.models.timeout(),
    );

    if !backend.load_model(&CancellationToken::new()).await {
        tracing::warn!("Local model failed to load. Using fallback clues only.");
    }
    backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::local_llm::MockModelLoader;
    use spellwright_domain::{NpcArchetype, NpcIdentity, PromptContext};
    use std::io::Write;

    fn offline_settings() -> AppSettings {
        AppSettings {
            ollama_base_url: "http://127.0.0.1:9".to_string(),
            ..AppSettings::default()
        }
    }

    fn context(word: &str) -> PromptContext {
        PromptContext::new(
            NpcIdentity::new("Vex", NpcArchetype::Riddlemaster),
            word,
            "Structures",
            1,
        )
    }

    #[tokio::test]
    async fn test_offline_ollama_serves_bundled_clues() {
        let app = App::build(&offline_settings()).await;

        assert!(!app.clues.is_model_loaded());
        assert!(app.clues.is_fallback_available());

        let clue = app.clues.generate_clue(&context("bridge")).await;
        assert!(clue.used_fallback);
        assert_eq!(
            Some(clue.clue_text),
            app.fallback.get_clue("bridge", 1).map(|c| c.clue_text)
        );

        app.shutdown().await;
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_fallback_file_replaces_bundled_clues() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"words": {"anvil": {"category": "Tools", "clues": ["Struck by hammers."]}}}"#)
            .unwrap();

        let settings = AppSettings {
            fallback_clues_path: Some(file.path().to_path_buf()),
            ..offline_settings()
        };
        let app = App::build(&settings).await;

        assert_eq!(app.fallback.word_count(), 1);
        let clue = app.clues.generate_clue(&context("anvil")).await;
        assert_eq!(clue.clue_text, "Struck by hammers.");
    }

    #[tokio::test]
    async fn test_missing_fallback_file_uses_bundled_clues() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            fallback_clues_path: Some(dir.path().join("nope.json")),
            ..offline_settings()
        };
        let app = App::build(&settings).await;

        assert!(app.fallback.has_word("bridge"));
    }

    #[tokio::test]
    async fn test_local_backend_without_model_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AppSettings {
            backend: BackendKind::Local,
            ..offline_settings()
        };
        settings.local.model_dir = dir.path().to_path_buf();

        let mut loader = MockModelLoader::new();
        loader.expect_load().never();
        let app = App::build_with_loader(&settings, Arc::new(loader)).await;

        assert!(!app.clues.is_model_loaded());
        let clue = app.clues.generate_clue(&context("lantern")).await;
        assert!(clue.clue_text.starts_with("Think about the category"));
    }
}
