//! Memory module for cortex-chat
//!
//! Provides the conversation memory model, its on-disk store, the rolling
//! summarizer, and context assembly for model requests.

mod context;
mod model;
mod store;
mod summarizer;

pub use context::{build_context, memory_intro, SUMMARY_PREFIX};
pub use model::{ConversationMemory, MemoryWindow, Role, Turn};
pub use store::MemoryStore;
pub use summarizer::{Summarizer, SUMMARIZER_SYSTEM_PROMPT};
