//! Use cases - User story orchestration.
//!
//! Use cases compose the inference port, parsers and stores into the
//! operations the game calls.

pub mod clue;

pub use clue::ClueOrchestrator;
