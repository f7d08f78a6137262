//! Language-model client boundary
//!
//! The session core only sees the [`ModelClient`] trait. [`OpenAiClient`] is the
//! production implementation over the Chat Completions wire format.

mod openai;

pub use openai::{OpenAiClient, DEFAULT_API_BASE};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::memory::{Role, Turn};

/// A finite, non-restartable sequence of reply chunks.
///
/// Concatenating every `Ok` chunk yields the same text a non-streamed
/// completion would have returned.
pub type TextStream = BoxStream<'static, Result<String, ApiError>>;

/// Role of a message sent to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single chat message in a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        let role = match turn.role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        };
        Self {
            role,
            content: turn.content.clone(),
        }
    }
}

/// Per-request generation options
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask for an incremental [`Completion::Stream`] instead of a full text
    pub stream: bool,
}

/// What a completion call hands back
pub enum Completion {
    /// Whole reply at once
    Text(String),
    /// Reply delivered incrementally
    Stream(TextStream),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Failure category reported by a model client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Auth,
    Network,
    RateLimit,
    Server,
    /// The API rejected the request itself (bad model, context too long, ...)
    InvalidRequest,
    /// The API answered with something we could not use
    InvalidResponse,
}

impl ApiErrorKind {
    /// Transient failures worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Server)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Auth => "authentication",
            Self::Network => "network",
            Self::RateLimit => "rate limit",
            Self::Server => "server",
            Self::InvalidRequest => "invalid request",
            Self::InvalidResponse => "invalid response",
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error returned across the model-client boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("API {kind} error: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Auth, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Server, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::InvalidResponse, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// A hosted language model the session can talk to.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate the reply for a conversation turn.
    ///
    /// Returns [`Completion::Stream`] when `options.stream` is set.
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, ApiError>;

    /// Generate a rolling-summary update, capped at `max_tokens`.
    async fn complete_for_summary(
        &self,
        messages: &[Message],
        max_tokens: u32,
    ) -> Result<String, ApiError>;
}
