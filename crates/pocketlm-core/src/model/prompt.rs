//! Chat prompt formatting.

use serde::{Deserialize, Serialize};

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"` or `"assistant"`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Create a message with an arbitrary role.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Renders a conversation into the text a model was tuned on.
pub trait ChatTemplate: Send + Sync {
    /// Render `messages`, ending with the cue for the next assistant turn.
    fn apply(&self, messages: &[ChatMessage]) -> String;
}

/// Phi-3 instruct format (`<|user|>`, `<|assistant|>`, `<|end|>`).
#[derive(Debug, Clone, Default)]
pub struct Phi3PromptBuilder {
    system: String,
}

impl Phi3PromptBuilder {
    /// Builder with a system prompt; an empty one is omitted from single-turn prompts.
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    /// The system prompt.
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Single-turn prompt for `user`.
    pub fn build_prompt(&self, user: &str) -> String {
        let mut prompt = String::new();
        if !self.system.is_empty() {
            prompt.push_str(&format!("<|system|>\n{}<|end|>\n", self.system));
        }
        prompt.push_str(&format!("<|user|>\n{}<|end|>\n<|assistant|>\n", user));
        prompt
    }

    /// Multi-turn prompt.
    ///
    /// Only user and assistant messages are rendered. The assistant cue is
    /// appended unless the conversation already ends on an assistant turn.
    pub fn build_multi_turn(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = format!("<|system|>\n{}\n", self.system);
        for message in messages {
            if matches!(message.role.as_str(), "user" | "assistant") {
                prompt.push_str(&format!("<|{}|>\n{}\n", message.role, message.content));
            }
        }
        if messages.last().map(|m| m.role.as_str()) != Some("assistant") {
            prompt.push_str("<|assistant|>\n");
        }
        prompt
    }
}

impl ChatTemplate for Phi3PromptBuilder {
    fn apply(&self, messages: &[ChatMessage]) -> String {
        match messages {
            [only] if only.role == "user" => self.build_prompt(&only.content),
            _ => self.build_multi_turn(messages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_turn_with_system() {
        let builder = Phi3PromptBuilder::new("Be brief.");
        assert_eq!(
            builder.build_prompt("Hi"),
            "<|system|>\nBe brief.<|end|>\n<|user|>\nHi<|end|>\n<|assistant|>\n"
        );
    }

    #[test]
    fn empty_system_is_omitted() {
        let builder = Phi3PromptBuilder::default();
        assert_eq!(
            builder.build_prompt("Hi"),
            "<|user|>\nHi<|end|>\n<|assistant|>\n"
        );
    }

    #[test]
    fn multi_turn_skips_unknown_roles() {
        let builder = Phi3PromptBuilder::new("sys");
        let messages = vec![
            ChatMessage::user("a"),
            ChatMessage::new("tool", "ignored"),
            ChatMessage::assistant("b"),
            ChatMessage::user("c"),
        ];
        assert_eq!(
            builder.build_multi_turn(&messages),
            "<|system|>\nsys\n<|user|>\na\n<|assistant|>\nb\n<|user|>\nc\n<|assistant|>\n"
        );
    }

    #[test]
    fn trailing_assistant_gets_no_cue() {
        let builder = Phi3PromptBuilder::new("sys");
        let prompt = builder.build_multi_turn(&[ChatMessage::user("a"), ChatMessage::assistant("b")]);
        assert!(prompt.ends_with("<|assistant|>\nb\n"));
    }

    #[test]
    fn template_dispatches_on_turn_count() {
        let builder = Phi3PromptBuilder::new("sys");
        assert_eq!(
            builder.apply(&[ChatMessage::user("q")]),
            builder.build_prompt("q")
        );
        let two = [ChatMessage::user("q"), ChatMessage::assistant("r")];
        assert_eq!(builder.apply(&two), builder.build_multi_turn(&two));
    }
}
