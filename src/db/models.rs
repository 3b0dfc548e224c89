use serde::{Deserialize, Serialize};

/// Title used until the first user message arrives.
pub const NEW_CHAT_TITLE: &str = "New Chat";

const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "bot" => Some(Role::Bot),
            _ => None,
        }
    }

    /// Role name on the model-call wire.
    pub fn api_role(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "assistant",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    /// Always the timestamp of the most recently appended message.
    pub updated_at: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub images: Option<Vec<String>>,
    pub image_descriptions: Option<Vec<String>>,
    pub created_at: String,
}

/// One entry of the bounded context window handed to the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContextEntry {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    /// Captions cached when the message's images were saved.
    #[serde(default)]
    pub image_descriptions: Vec<String>,
}

/// Conversation row without its messages, for history listings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: String,
}

/// Title derived from the first user message.
pub fn title_from_message(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return NEW_CHAT_TITLE.to_string();
    }
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_short_message_kept() {
        assert_eq!(title_from_message("  Fix my borrow error "), "Fix my borrow error");
    }

    #[test]
    fn test_title_truncated_to_forty_chars() {
        let title = title_from_message(&"x".repeat(60));
        assert_eq!(title, format!("{}...", "x".repeat(40)));
    }

    #[test]
    fn test_title_counts_chars_not_bytes() {
        let title = title_from_message(&"é".repeat(41));
        assert_eq!(title.chars().count(), 43);
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(Role::parse("bot"), Some(Role::Bot));
        assert_eq!(Role::parse("system"), None);
        assert_eq!(Role::Bot.api_role(), "assistant");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
