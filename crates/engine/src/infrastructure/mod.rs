//! Infrastructure implementations.
//!
//! Contains the inference backends behind [`ports::InferencePort`] plus the
//! settings and concurrency primitives they share.

pub mod app_settings;
pub mod gate;
pub mod local_llm;
pub mod ollama;
pub mod ports;
