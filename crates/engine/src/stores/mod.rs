//! In-memory state storage modules.
//!
//! - `StaticFallbackStore` - pre-authored clues, read-only once loaded

pub mod fallback_clues;

pub use fallback_clues::{StaticFallbackStore, StoreError, BUNDLED_FALLBACK_CLUES};
