//! Session controller: one turn-cycle at a time
//!
//! A turn-cycle walks `Idle → ContextBuilt → ResponseReceived →
//! MemoryUpdated → Persisted → Idle`. Memory is only mutated once a full
//! reply is in hand, and both sides of the exchange land in one step, so a
//! failed or cancelled call never leaves half an exchange behind. Once the
//! exchange is in memory it is always kept, even if the caller stops
//! waiting.
//!
//! Summarization and persistence failures are recovered here and reported
//! as [`Warning`]s; only the model call itself can fail a turn.

use crate::llm::{ApiError, Completion, CompletionOptions, ModelClient};
use crate::memory::{build_context, ConversationMemory, MemoryStore, MemoryWindow, Summarizer};
use crate::{Error, Result};
use futures::StreamExt;
use std::fmt;
use tracing::{debug, info, warn};

/// Where the controller is within a turn-cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ContextBuilt,
    ResponseReceived,
    MemoryUpdated,
    Persisted,
}

impl SessionState {
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }
}

/// A recovered, non-fatal problem the user should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// The memory file could not be read; the session started empty
    CorruptState(String),
    /// Summarization failed; overflow turns are kept and retried next turn
    SummaryDeferred(ApiError),
    /// The memory file was not updated; the next run may miss this turn
    PersistFailed(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptState(reason) => {
                write!(f, "Memory file was unreadable and has been ignored: {}", reason)
            }
            Self::SummaryDeferred(e) => {
                write!(f, "Summary update failed, will retry next turn: {}", e)
            }
            Self::PersistFailed(reason) => {
                write!(f, "Could not save memory, this turn may be lost on restart: {}", reason)
            }
        }
    }
}

/// Result of a completed turn-cycle
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    /// Whether overflow turns were folded into the summary this cycle
    pub summarized: bool,
    pub warnings: Vec<Warning>,
}

/// Result of [`SessionController::settle`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settled {
    /// Whether overflow turns were folded into the summary
    pub summarized: bool,
    pub warnings: Vec<Warning>,
}

/// What became of a turn the caller stopped waiting for
#[derive(Debug, Clone, PartialEq)]
pub enum Abandoned {
    /// The reply never reached memory
    NotRecorded,
    /// The exchange was already in memory and has been kept
    Kept { warnings: Vec<Warning> },
}

/// Everything a session needs besides the client and the store
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub system_prompt: String,
    pub window: MemoryWindow,
    pub options: CompletionOptions,
    pub max_summary_tokens: u32,
}

/// Owns the conversation memory for the lifetime of the process
pub struct SessionController<C: ModelClient> {
    client: C,
    store: MemoryStore,
    memory: ConversationMemory,
    summarizer: Summarizer,
    settings: SessionSettings,
    state: SessionState,
}

impl<C: ModelClient> SessionController<C> {
    /// Load memory from `store` and start a session.
    ///
    /// A corrupt memory file does not stop the session: it starts empty and
    /// a [`Warning::CorruptState`] is returned.
    pub async fn open(client: C, store: MemoryStore, settings: SessionSettings) -> (Self, Vec<Warning>) {
        let mut warnings = Vec::new();
        let memory = match store.load().await {
            Ok(memory) => memory,
            Err(e) => {
                warn!("{}. Starting with empty memory.", e);
                warnings.push(Warning::CorruptState(e.to_string()));
                ConversationMemory::new()
            }
        };

        let summarizer = Summarizer::new(settings.max_summary_tokens);
        let controller = Self {
            client,
            store,
            memory,
            summarizer,
            settings,
            state: SessionState::Idle,
        };
        (controller, warnings)
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run one full turn-cycle for `input`: [`exchange`](Self::exchange)
    /// followed by [`settle`](Self::settle).
    ///
    /// Streamed chunks are handed to `on_chunk` as they arrive; a
    /// non-streamed reply is only returned in the outcome.
    pub async fn turn<F>(&mut self, input: &str, on_chunk: F) -> Result<TurnOutcome>
    where
        F: FnMut(&str),
    {
        let reply = self.exchange(input, on_chunk).await?;
        let Settled {
            summarized,
            warnings,
        } = self.settle().await;
        Ok(TurnOutcome {
            reply,
            summarized,
            warnings,
        })
    }

    /// First half of a turn-cycle: ask the model and commit the exchange.
    ///
    /// Ends in `MemoryUpdated` on success. Nothing is awaited after the
    /// commit, so dropping this future either records the whole exchange or
    /// nothing at all. The caller must follow up with [`settle`](Self::settle)
    /// or [`abandon_turn`](Self::abandon_turn).
    pub async fn exchange<F>(&mut self, input: &str, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        if !self.state.is_idle() {
            return Err(Error::SessionBusy(self.state));
        }
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::EmptyInput);
        }

        let messages = build_context(&self.memory, &self.settings.system_prompt, input);
        self.transition(SessionState::ContextBuilt);

        let reply = match self.request_reply(&messages, &mut on_chunk).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Model call failed, turn not recorded: {}", e);
                self.transition(SessionState::Idle);
                return Err(Error::Api(e));
            }
        };
        self.transition(SessionState::ResponseReceived);

        self.memory.append_exchange(input, &reply);
        self.transition(SessionState::MemoryUpdated);
        Ok(reply)
    }

    /// Second half of a turn-cycle: summarize if the window overflowed,
    /// save, and return to `Idle`.
    ///
    /// Does nothing unless an exchange has been committed. Failures here
    /// never undo the exchange; they come back as warnings.
    pub async fn settle(&mut self) -> Settled {
        if self.state != SessionState::MemoryUpdated {
            return Settled::default();
        }

        let mut settled = Settled::default();
        match self.summarize_if_needed().await {
            Ok(summarized) => settled.summarized = summarized,
            Err(e) => {
                warn!("Summarization deferred: {}", e);
                settled.warnings.push(Warning::SummaryDeferred(e));
            }
        }

        if let Err(e) = self.store.save(&self.memory).await {
            warn!("{}", e);
            settled.warnings.push(Warning::PersistFailed(e.to_string()));
        }
        self.transition(SessionState::Persisted);
        self.transition(SessionState::Idle);
        settled
    }

    /// Call the model and drain a streamed reply completely.
    async fn request_reply<F>(
        &self,
        messages: &[crate::llm::Message],
        on_chunk: &mut F,
    ) -> std::result::Result<String, ApiError>
    where
        F: FnMut(&str),
    {
        debug!("Requesting reply with {} context messages", messages.len());
        let reply = match self.client.complete(messages, &self.settings.options).await? {
            Completion::Text(text) => text,
            Completion::Stream(mut stream) => {
                let mut full = String::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    on_chunk(&chunk);
                    full.push_str(&chunk);
                }
                full
            }
        };

        if reply.trim().is_empty() {
            return Err(ApiError::invalid_response("model returned an empty reply"));
        }
        Ok(reply)
    }

    /// Fold overflow into the summary when the window is exceeded.
    ///
    /// On failure memory is left untouched so the same overflow is retried
    /// next cycle.
    async fn summarize_if_needed(&mut self) -> std::result::Result<bool, ApiError> {
        if !self.memory.needs_summarization(&self.settings.window) {
            return Ok(false);
        }
        let (overflow, retained) = self.memory.overflow(&self.settings.window);
        if overflow.is_empty() {
            return Ok(false);
        }

        let summary = self
            .summarizer
            .summarize(&self.client, self.memory.summary(), &overflow)
            .await?;
        self.memory.apply_summary(summary, retained);
        info!(
            "Folded {} turns into summary, {} retained",
            overflow.len(),
            self.memory.recent().len()
        );
        Ok(true)
    }

    /// Clear memory in-process and on disk. Only allowed between turns.
    pub async fn reset(&mut self) -> Result<()> {
        if !self.state.is_idle() {
            return Err(Error::SessionBusy(self.state));
        }
        self.memory.clear();
        self.store.reset().await?;
        info!("Conversation memory reset");
        Ok(())
    }

    /// Return to `Idle` after the caller dropped an in-flight
    /// [`exchange`](Self::exchange) or [`turn`](Self::turn).
    ///
    /// An exchange dropped before its reply was committed leaves no trace.
    /// One dropped after the commit is kept, and is summarized and saved
    /// here so memory and disk agree again.
    pub async fn abandon_turn(&mut self) -> Abandoned {
        match self.state {
            SessionState::Idle => Abandoned::NotRecorded,
            SessionState::ContextBuilt | SessionState::ResponseReceived => {
                info!("Turn abandoned in state {:?}, nothing recorded", self.state);
                self.transition(SessionState::Idle);
                Abandoned::NotRecorded
            }
            SessionState::MemoryUpdated => {
                info!("Turn abandoned after its reply was committed, saving it");
                let Settled { warnings, .. } = self.settle().await;
                Abandoned::Kept { warnings }
            }
            SessionState::Persisted => {
                self.transition(SessionState::Idle);
                Abandoned::Kept {
                    warnings: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_messages() {
        let w = Warning::SummaryDeferred(ApiError::network("down"));
        assert!(w.to_string().contains("retry next turn"));
        assert!(Warning::PersistFailed("disk full".into())
            .to_string()
            .contains("disk full"));
    }

    #[test]
    fn test_only_idle_is_idle() {
        assert!(SessionState::Idle.is_idle());
        assert!(!SessionState::MemoryUpdated.is_idle());
    }
}
