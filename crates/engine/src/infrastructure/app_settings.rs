//! Application settings for the clue engine
//!
//! Settings are read once at startup from the process environment (after
//! `.env` has been loaded by the binary) and passed into the backends. They
//! are read-only afterwards.
//!
//! | Variable                     | Default                      |
//! |------------------------------|------------------------------|
//! | `SPELLWRIGHT_BACKEND`        | `ollama`                     |
//! | `OLLAMA_BASE_URL`            | `http://localhost:11434`     |
//! | `SPELLWRIGHT_PRIMARY_MODEL`  | `qwen2.5:7b`                 |
//! | `SPELLWRIGHT_FALLBACK_MODEL` | `llama3.2:3b`                |
//! | `SPELLWRIGHT_TIMEOUT_SECS`   | 15 (ollama) / 30 (local)     |
//! | `SPELLWRIGHT_TEMPERATURE`    | 0.8                          |
//! | `SPELLWRIGHT_MAX_TOKENS`     | 200                          |
//! | `SPELLWRIGHT_MODEL_DIR`      | `models`                     |
//! | `SPELLWRIGHT_MODEL_FILE`     | `llama-3.2-3b-q4_k_m.gguf`   |
//! | `SPELLWRIGHT_CONTEXT_SIZE`   | 2048                         |
//! | `SPELLWRIGHT_GPU_LAYERS`     | 99                           |
//! | `SPELLWRIGHT_FALLBACK_CLUES` | bundled data file            |
//! | `SPELLWRIGHT_KEEP_ALIVE`     | unset                        |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default Ollama base URL.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Default primary model tag for Ollama.
pub const DEFAULT_PRIMARY_MODEL: &str = "qwen2.5:7b";

/// Default fallback model tag for Ollama.
pub const DEFAULT_FALLBACK_MODEL: &str = "llama3.2:3b";

/// Default GGUF file for the in-process backend.
pub const DEFAULT_MODEL_FILE: &str = "llama-3.2-3b-q4_k_m.gguf";

const DEFAULT_REMOTE_TIMEOUT_SECS: f64 = 15.0;
const DEFAULT_LOCAL_TIMEOUT_SECS: f64 = 30.0;
/// One day; longer timeouts are treated as configuration mistakes.
const MAX_TIMEOUT_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl SettingsError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Which inference backend the engine runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Remote Ollama server over HTTP
    #[default]
    Ollama,
    /// Model weights loaded into this process
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Ollama => write!(f, "ollama"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" | "remote" | "http" => Ok(BackendKind::Ollama),
            "local" | "in_process" | "inprocess" | "llama" => Ok(BackendKind::Local),
            _ => Err(()),
        }
    }
}

/// Sampling options sent with every generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            max_tokens: 200,
        }
    }
}

/// Primary/fallback model pair plus per-call limits.
///
/// Set once when a backend is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChainConfig {
    pub primary_model: String,
    pub fallback_model: String,
    pub timeout_secs: f64,
    pub options: GenerationOptions,
}

impl ModelChainConfig {
    /// Per-call timeout. Values that are not a usable duration map to the
    /// remote default.
    pub fn timeout(&self) -> Duration {
        checked_timeout(self.timeout_secs)
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_REMOTE_TIMEOUT_SECS))
    }
}

impl Default for ModelChainConfig {
    fn default() -> Self {
        Self {
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            options: GenerationOptions::default(),
        }
    }
}

/// Load parameters for the in-process model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalModelParams {
    pub model_dir: PathBuf,
    pub model_file: String,
    /// Context window size in tokens
    pub context_size: u32,
    /// Layers to offload to the GPU; 99 offloads everything
    pub gpu_layers: u32,
}

impl LocalModelParams {
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }
}

impl Default for LocalModelParams {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            model_file: DEFAULT_MODEL_FILE.to_string(),
            context_size: 2048,
            gpu_layers: 99,
        }
    }
}

/// Everything the composition root needs to build the clue pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub backend: BackendKind,
    pub ollama_base_url: String,
    pub models: ModelChainConfig,
    pub local: LocalModelParams,
    /// Path to a fallback clue file; `None` uses the bundled data
    pub fallback_clues_path: Option<PathBuf>,
    /// Keep-alive hint sent to Ollama for the primary model at startup
    pub keep_alive: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            models: ModelChainConfig::default(),
            local: LocalModelParams::default(),
            fallback_clues_path: None,
            keep_alive: None,
        }
    }
}

impl AppSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let backend = match get("SPELLWRIGHT_BACKEND") {
            Some(raw) => BackendKind::from_str(&raw).map_err(|_| {
                SettingsError::invalid("SPELLWRIGHT_BACKEND", &raw, "expected 'ollama' or 'local'")
            })?,
            None => BackendKind::default(),
        };

        let default_timeout = match backend {
            BackendKind::Ollama => DEFAULT_REMOTE_TIMEOUT_SECS,
            BackendKind::Local => DEFAULT_LOCAL_TIMEOUT_SECS,
        };
        let defaults = GenerationOptions::default();
        let local_defaults = LocalModelParams::default();

        let models = ModelChainConfig {
            primary_model: get("SPELLWRIGHT_PRIMARY_MODEL")
                .unwrap_or_else(|| DEFAULT_PRIMARY_MODEL.to_string()),
            fallback_model: get("SPELLWRIGHT_FALLBACK_MODEL")
                .unwrap_or_else(|| DEFAULT_FALLBACK_MODEL.to_string()),
            timeout_secs: parse_or(
                "SPELLWRIGHT_TIMEOUT_SECS",
                get("SPELLWRIGHT_TIMEOUT_SECS"),
                default_timeout,
            )?,
            options: GenerationOptions {
                temperature: parse_or(
                    "SPELLWRIGHT_TEMPERATURE",
                    get("SPELLWRIGHT_TEMPERATURE"),
                    defaults.temperature,
                )?,
                max_tokens: parse_or(
                    "SPELLWRIGHT_MAX_TOKENS",
                    get("SPELLWRIGHT_MAX_TOKENS"),
                    defaults.max_tokens,
                )?,
            },
        };

        if checked_timeout(models.timeout_secs).is_none() {
            return Err(SettingsError::invalid(
                "SPELLWRIGHT_TIMEOUT_SECS",
                &models.timeout_secs.to_string(),
                format!("must be a positive number of seconds up to {MAX_TIMEOUT_SECS}"),
            ));
        }

        let local = LocalModelParams {
            model_dir: get("SPELLWRIGHT_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(local_defaults.model_dir),
            model_file: get("SPELLWRIGHT_MODEL_FILE").unwrap_or(local_defaults.model_file),
            context_size: parse_or(
                "SPELLWRIGHT_CONTEXT_SIZE",
                get("SPELLWRIGHT_CONTEXT_SIZE"),
                local_defaults.context_size,
            )?,
            gpu_layers: parse_or(
                "SPELLWRIGHT_GPU_LAYERS",
                get("SPELLWRIGHT_GPU_LAYERS"),
                local_defaults.gpu_layers,
            )?,
        };

        Ok(Self {
            backend,
            ollama_base_url: get("OLLAMA_BASE_URL")
                .or_else(|| get("OLLAMA_URL"))
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string()),
            models,
            local,
            fallback_clues_path: get("SPELLWRIGHT_FALLBACK_CLUES").map(PathBuf::from),
            keep_alive: get("SPELLWRIGHT_KEEP_ALIVE"),
        })
    }
}

fn checked_timeout(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_TIMEOUT_SECS {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| SettingsError::invalid(key, &raw, e)),
        None => Ok(default),
    }
}
