//! Spellwright Engine library.
//!
//! Clue generation for the Spellwright word-guessing game.
//!
//! ## Structure
//!
//! - `infrastructure/` - Inference backends (Ollama, in-process) behind a port
//! - `use_cases/` - Clue orchestration, prompt building and response parsing
//! - `stores/` - Static fallback clue table
//! - `app` - Application composition

pub mod app;
pub mod infrastructure;
pub mod stores;
pub mod use_cases;

pub use app::App;
