//! Port traits for infrastructure boundaries.
//!
//! The inference backend is the only abstraction in the engine. Everything
//! else is concrete types. The port exists so that:
//! - the in-process model and the Ollama server are interchangeable
//! - use cases can be tested against a mock backend

mod error;
mod external;

// =============================================================================
// External Service Ports
// =============================================================================
pub use external::{
    chat_structured, extract_json, ChatMessage, InferencePort, MessageRole, ModelAvailability,
    TokenSink, TokenStream,
};

#[cfg(test)]
pub use external::MockInferencePort;

// =============================================================================
// Error Types
// =============================================================================
pub use error::InferenceError;
