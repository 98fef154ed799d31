//! Value objects for the clue generation pipeline.

mod clue;
mod mood;
mod npc;

pub use clue::{AssembledPrompt, ClueResult, PromptContext};
pub use mood::ClueMood;
pub use npc::{NpcArchetype, NpcIdentity};
