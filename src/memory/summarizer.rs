//! Rolling summary generation
//!
//! When the recent window overflows, the oldest turns are folded into the
//! running summary by asking the model for a replacement summary:
//!   1. Render the prior summary and the overflow turns in order
//!   2. Ask for an updated summary within the token budget
//!   3. Hand the new text back; the caller decides whether to trim
//!
//! Nothing is trimmed here. A failed call leaves the caller free to keep the
//! overflow turns and try again on the next turn-cycle.

use super::model::Turn;
use crate::llm::{ApiError, Message, ModelClient};
use tracing::{debug, info};

/// System message for every summarization request
pub const SUMMARIZER_SYSTEM_PROMPT: &str =
    "You are a summarizer that maintains a concise, factual summary of an ongoing conversation.";

/// Produces bounded replacement summaries through a [`ModelClient`].
#[derive(Debug, Clone, Copy)]
pub struct Summarizer {
    max_summary_tokens: u32,
}

impl Summarizer {
    pub fn new(max_summary_tokens: u32) -> Self {
        Self { max_summary_tokens }
    }

    pub fn max_summary_tokens(&self) -> u32 {
        self.max_summary_tokens
    }

    /// Fold `overflow` into `prior_summary`.
    ///
    /// With no overflow the prior summary comes back unchanged and the
    /// client is never called.
    pub async fn summarize<C>(
        &self,
        client: &C,
        prior_summary: &str,
        overflow: &[Turn],
    ) -> Result<String, ApiError>
    where
        C: ModelClient + ?Sized,
    {
        if overflow.is_empty() {
            debug!("No overflow turns, skipping summarization");
            return Ok(prior_summary.to_string());
        }

        info!(
            "Summarizing {} overflow turns into rolling summary (budget {} tokens)",
            overflow.len(),
            self.max_summary_tokens
        );

        let messages = self.build_request(prior_summary, overflow);
        let summary = client
            .complete_for_summary(&messages, self.max_summary_tokens)
            .await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(ApiError::invalid_response("summarizer returned an empty summary"));
        }

        info!(
            "Rolling summary updated: {} -> {} chars",
            prior_summary.len(),
            summary.len()
        );
        Ok(summary.to_string())
    }

    /// The exact messages sent for one summarization
    pub fn build_request(&self, prior_summary: &str, overflow: &[Turn]) -> Vec<Message> {
        let prior = if prior_summary.trim().is_empty() {
            "(none yet)"
        } else {
            prior_summary.trim()
        };

        let prompt = format!(
            "Condense the following prior summary and additional exchanges into an updated \
             summary capturing key facts, user preferences, and open threads, within {} tokens.\n\n\
             === PRIOR SUMMARY ===\n{}\n\n\
             === ADDITIONAL EXCHANGES ===\n{}\n\n\
             === UPDATED SUMMARY ===",
            self.max_summary_tokens,
            prior,
            format_exchanges(overflow)
        );

        vec![Message::system(SUMMARIZER_SYSTEM_PROMPT), Message::user(prompt)]
    }
}

/// Render turns as `Role: content` lines, oldest first
fn format_exchanges(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role.label(), t.content))
        .collect::<Vec<_>>()
        .join("\n")
}
