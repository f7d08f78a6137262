//! Context builder for model requests

use super::model::{ConversationMemory, MemoryWindow};
use crate::llm::Message;

/// Prefix of the synthetic system message carrying the rolling summary
pub const SUMMARY_PREFIX: &str = "SUMMARY: ";

/// Builds the ordered message list for one turn
pub struct ContextBuilder<'a> {
    memory: &'a ConversationMemory,
    system_prompt: &'a str,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(memory: &'a ConversationMemory) -> Self {
        Self {
            memory,
            system_prompt: "",
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &'a str) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// System prompt, summary, recent turns, then the new input. Empty
    /// prompt and summary are left out.
    pub fn build(&self, new_input: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.memory.recent().len() + 3);

        if !self.system_prompt.trim().is_empty() {
            messages.push(Message::system(self.system_prompt));
        }

        let summary = self.memory.summary();
        if !summary.trim().is_empty() {
            messages.push(Message::system(format!("{}{}", SUMMARY_PREFIX, summary)));
        }

        messages.extend(self.memory.recent().iter().map(Message::from));
        messages.push(Message::user(new_input));
        messages
    }
}

/// Assemble the context for the current turn without touching `memory`.
pub fn build_context(
    memory: &ConversationMemory,
    system_prompt: &str,
    new_input: &str,
) -> Vec<Message> {
    ContextBuilder::new(memory)
        .with_system_prompt(system_prompt)
        .build(new_input)
}

/// Tells the model how its memory works so it does not pretend to recall
/// more than the summary and window provide.
pub fn memory_intro(window: &MemoryWindow) -> String {
    format!(
        "INTRO: This is a CLI environment with simulated memory.\n\
         You do not have full access to previous conversations, but you may receive a \
         rolling summary and up to the {} most recent messages. Once more than {} messages \
         accumulate, the oldest are folded into the summary to retain context while \
         conserving memory.",
        window.memory_limit, window.summary_threshold
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageRole;
    use crate::memory::Role;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_context_order() {
        let mut memory = ConversationMemory::new();
        memory.replace_summary("User is learning Rust.");
        memory.append_turn(Role::User, "What is Box?");
        memory.append_turn(Role::Assistant, "A heap pointer.");

        let messages = build_context(&memory, "Be brief.", "And Rc?");
        assert_eq!(
            messages,
            vec![
                Message::system("Be brief."),
                Message::system("SUMMARY: User is learning Rust."),
                Message::user("What is Box?"),
                Message::assistant("A heap pointer."),
                Message::user("And Rc?"),
            ]
        );
    }

    #[test]
    fn test_build_context_skips_empty_prompt_and_summary() {
        let memory = ConversationMemory::new();
        let messages = build_context(&memory, "  ", "hello");
        assert_eq!(messages, vec![Message::user("hello")]);
    }

    #[test]
    fn test_build_context_does_not_mutate_memory() {
        let mut memory = ConversationMemory::new();
        memory.append_turn(Role::User, "one");
        let before = memory.clone();
        let _ = build_context(&memory, "sys", "two");
        assert_eq!(memory, before);
    }

    #[test]
    fn test_memory_intro_mentions_window() {
        let intro = memory_intro(&MemoryWindow::new(6).with_threshold(12));
        assert!(intro.contains("6 most recent"));
        assert!(intro.contains("more than 12"));
        assert_eq!(Message::system(intro).role, MessageRole::System);
    }
}
