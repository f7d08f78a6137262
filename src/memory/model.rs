//! In-memory conversation state: rolling summary plus recent turns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One role-tagged message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// When the turn was recorded. Older memory files carry no timestamp.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Size limits for the retained window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWindow {
    /// Turns kept verbatim after a summarization
    pub memory_limit: usize,
    /// Summarization runs once `recent` grows past this many turns
    pub summary_threshold: usize,
}

impl MemoryWindow {
    /// Window where the trigger and the retained size are the same
    pub fn new(memory_limit: usize) -> Self {
        Self {
            memory_limit,
            summary_threshold: memory_limit,
        }
    }

    pub fn with_threshold(mut self, summary_threshold: usize) -> Self {
        self.summary_threshold = summary_threshold;
        self
    }
}

impl Default for MemoryWindow {
    fn default() -> Self {
        Self::new(10)
    }
}

/// The persisted conversation aggregate.
///
/// `recent` is chronological, most recent last, and only ever exposed as a
/// shared slice so appended turns stay immutable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMemory {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    recent: Vec<Turn>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn recent(&self) -> &[Turn] {
        &self.recent
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.recent.is_empty()
    }

    /// Append a turn. Blank content is ignored.
    pub fn append_turn(&mut self, role: Role, content: impl Into<String>) {
        let content = content.into();
        if content.trim().is_empty() {
            debug!("Ignoring blank {} turn", role.label());
            return;
        }
        self.recent.push(Turn::new(role, content));
    }

    /// Append a user turn and its reply together, or neither.
    ///
    /// Returns `false` when either side is blank and nothing was recorded.
    pub fn append_exchange(&mut self, user: &str, assistant: &str) -> bool {
        if user.trim().is_empty() || assistant.trim().is_empty() {
            return false;
        }
        self.append_turn(Role::User, user);
        self.append_turn(Role::Assistant, assistant);
        true
    }

    pub fn needs_summarization(&self, window: &MemoryWindow) -> bool {
        self.recent.len() > window.summary_threshold
    }

    /// Split `recent` into the oldest excess turns and the retained tail.
    ///
    /// The first part holds `len - memory_limit` turns; when `recent` is not
    /// longer than the limit there is no overflow.
    pub fn overflow(&self, window: &MemoryWindow) -> (Vec<Turn>, Vec<Turn>) {
        let split = self.recent.len().saturating_sub(window.memory_limit);
        let (old, kept) = self.recent.split_at(split);
        (old.to_vec(), kept.to_vec())
    }

    pub fn replace_summary(&mut self, new_summary: impl Into<String>) {
        self.summary = new_summary.into();
    }

    pub fn set_recent(&mut self, turns: Vec<Turn>) {
        self.recent = turns;
    }

    /// Install a freshly generated summary together with the retained turns.
    pub fn apply_summary(&mut self, new_summary: impl Into<String>, retained: Vec<Turn>) {
        self.replace_summary(new_summary);
        self.set_recent(retained);
    }

    pub fn clear(&mut self) {
        self.summary.clear();
        self.recent.clear();
    }
}
