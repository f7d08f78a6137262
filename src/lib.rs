//! cortex-chat - terminal chat client with durable memory
//!
//! Talks to a hosted chat-completions API and keeps one conversation thread
//! alive across process invocations:
//! - Recent turns are kept verbatim in a bounded window
//! - Older turns are folded into a rolling summary by the model itself
//! - Memory is persisted atomically after every turn-cycle

pub mod config;
pub mod llm;
pub mod memory;
pub mod render;
pub mod session;
pub mod transcript;

pub use config::ChatConfig;
pub use llm::{ApiError, ApiErrorKind, Completion, CompletionOptions, Message, ModelClient};
pub use memory::{ConversationMemory, MemoryStore, MemoryWindow, Role, Turn};
pub use session::{
    Abandoned, SessionController, SessionSettings, SessionState, Settled, TurnOutcome, Warning,
};

use std::path::PathBuf;

/// Result type for cortex-chat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cortex-chat
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Memory file {path} is unreadable or corrupt: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Failed to persist memory to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Input is empty")]
    EmptyInput,

    #[error("A turn is still in progress (state: {0:?})")]
    SessionBusy(SessionState),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
