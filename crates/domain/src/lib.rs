//! Spellwright domain types.
//!
//! Pure value objects shared by the clue engine: the NPC giving a clue, the
//! request context, the assembled prompt and the resulting clue. No I/O.

pub mod error;
pub mod value_objects;

pub use error::DomainError;

// Re-export value objects used across the engine
pub use value_objects::{
    AssembledPrompt, ClueMood, ClueResult, NpcArchetype, NpcIdentity, PromptContext,
};
