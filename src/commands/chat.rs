use super::{
    ChatRequestPayload, EventSink, FileContext, OutboundEvent, ProtocolError, SessionHandler,
    RESET_CHAT,
};
use crate::db::models::Role;
use crate::pipeline::TurnInput;
use serde_json::json;
use tracing::{info, warn};

/// Appends each file as a fenced block headed by its name.
pub fn format_with_files(message: &str, files: &[FileContext]) -> String {
    if files.is_empty() {
        return message.to_string();
    }
    let mut formatted = message.to_string();
    formatted.push_str("\n\n");
    for file in files {
        formatted.push_str(&format!(
            "**{}**\n```{}\n{}\n```\n",
            file.name, file.language, file.content
        ));
    }
    formatted.trim_end().to_string()
}

impl SessionHandler {
    /// Announces a fresh conversation id. Nothing is stored until the first
    /// message arrives.
    pub(super) fn reset_chat(&self, view: &dyn EventSink) {
        let uid = self.db.new_conversation_id();
        info!(chat_id = %uid, "new chat");
        view.post(OutboundEvent::new(RESET_CHAT, json!({ "uid": uid })));
    }

    pub(super) async fn send_message(
        &self,
        view: &dyn EventSink,
        payload: ChatRequestPayload,
    ) -> Result<(), ProtocolError> {
        let chat_id = if payload.chat_id.trim().is_empty() {
            let generated = self.db.new_conversation_id();
            warn!(chat_id = %generated, "chat request without chat id, generated one");
            view.post(OutboundEvent::new(RESET_CHAT, json!({ "uid": generated })));
            generated
        } else {
            payload.chat_id
        };

        let text = format_with_files(&payload.message, &payload.files);
        let previews = payload.images.iter().map(|i| i.data_url.clone()).collect();
        view.post(OutboundEvent::message(Role::User, text.clone()).with_images(previews));

        let reply = self
            .pipeline
            .process_turn(TurnInput {
                chat_id,
                text,
                images: payload.images,
            })
            .await;
        view.post(OutboundEvent::message(Role::Bot, reply));
        Ok(())
    }

    /// Replays a stored conversation into a cleared view.
    pub(super) fn load_chat(&self, view: &dyn EventSink, chat_id: &str) -> Result<(), ProtocolError> {
        let Some(conversation) = self.db.get_conversation(chat_id)? else {
            warn!(%chat_id, "conversation not found");
            return Ok(());
        };

        view.post(OutboundEvent::new(RESET_CHAT, json!({ "uid": conversation.id })));
        for message in conversation.messages {
            let images = message
                .images
                .unwrap_or_default()
                .iter()
                .filter_map(|name| self.attachments.display_reference(name))
                .collect();
            view.post(
                OutboundEvent::message(message.role, message.content)
                    .with_images(images)
                    .replayed(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{InboundCommand, CHAT_REQUEST};
    use super::*;
    use crate::llm::testing::FakeBackend;
    use crate::llm::MessageContent;
    use crate::pipeline::{ImageAttachment, APOLOGY_REPLY};
    use serde_json::Value;

    fn request(chat_id: &str, message: &str) -> InboundCommand {
        InboundCommand::ChatRequest(ChatRequestPayload {
            message: message.into(),
            chat_id: chat_id.into(),
            timestamp: None,
            files: vec![],
            images: vec![],
        })
    }

    #[test]
    fn test_format_with_files() {
        let files = vec![
            FileContext {
                name: "lib.rs".into(),
                content: "pub fn a() {}".into(),
                language: "rust".into(),
            },
            FileContext {
                name: "notes.txt".into(),
                content: "todo".into(),
                language: "plaintext".into(),
            },
        ];
        assert_eq!(
            format_with_files("Explain", &files),
            "Explain\n\n**lib.rs**\n```rust\npub fn a() {}\n```\n**notes.txt**\n```plaintext\ntodo\n```"
        );
        assert_eq!(format_with_files("plain", &[]), "plain");
    }

    #[tokio::test]
    async fn test_reset_does_not_touch_store() {
        let s = session(FakeBackend::replying("x"));
        s.handler.handle(InboundCommand::ResetChat).await;
        s.handler.handle(InboundCommand::ResetChat).await;

        let events = s.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].command, RESET_CHAT);
        let first = events[0].content["uid"].as_str().unwrap();
        let second = events[1].content["uid"].as_str().unwrap();
        assert_ne!(first, second);
        assert!(s.db.list_conversations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_echoes_then_replies() {
        let s = session(FakeBackend::replying("Use iterators."));
        s.handler.handle(request("c1", "How do I loop?")).await;

        let events = s.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], OutboundEvent::message(Role::User, "How do I loop?"));
        assert_eq!(events[1], OutboundEvent::message(Role::Bot, "Use iterators."));

        let conv = s.db.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.title, "How do I loop?");
    }

    #[tokio::test]
    async fn test_send_includes_file_context() {
        let s = session(FakeBackend::replying("ok"));
        s.handler
            .handle(InboundCommand::ChatRequest(ChatRequestPayload {
                message: "Review".into(),
                chat_id: "c1".into(),
                timestamp: None,
                files: vec![FileContext {
                    name: "main.py".into(),
                    content: "print(1)".into(),
                    language: "python".into(),
                }],
                images: vec![],
            }))
            .await;

        let sent = s.backend.requests().pop().unwrap();
        let MessageContent::Text(text) = &sent.messages.last().unwrap().content else {
            panic!("expected text turn");
        };
        assert!(text.contains("```python\nprint(1)\n```"));
        let stored = s.db.get_conversation("c1").unwrap().unwrap();
        assert!(stored.messages[0].content.contains("**main.py**"));
    }

    #[tokio::test]
    async fn test_failed_send_still_replies() {
        let s = session(FakeBackend::new(|_| {
            Err(crate::llm::LlmError::Parse("bad".into()))
        }));
        s.handler.handle(request("c1", "hi")).await;
        let events = s.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].content, Value::String(APOLOGY_REPLY.into()));
        assert_eq!(events[1].role, Some(Role::Bot));
    }

    #[tokio::test]
    async fn test_empty_chat_id_gets_generated() {
        let s = session(FakeBackend::replying("ok"));
        s.handler.handle(request("", "orphan")).await;
        let list = s.db.list_conversations().unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].id.is_empty());

        let events = s.sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].command, RESET_CHAT);
        assert_eq!(events[0].content["uid"], list[0].id.as_str());
        assert_eq!(events[1].role, Some(Role::User));
    }

    #[tokio::test]
    async fn test_load_chat_replays_history() {
        let s = session(FakeBackend::replying("caption or reply"));
        s.handler
            .handle(InboundCommand::ChatRequest(ChatRequestPayload {
                message: "see image".into(),
                chat_id: "c1".into(),
                timestamp: None,
                files: vec![],
                images: vec![ImageAttachment {
                    data_url: "data:image/png;base64,aGVsbG8=".into(),
                    name: "a.png".into(),
                }],
            }))
            .await;
        let live = s.sink.events().len();

        s.handler
            .handle(InboundCommand::LoadChat {
                chat_id: "c1".into(),
            })
            .await;
        let replay: Vec<_> = s.sink.events().into_iter().skip(live).collect();
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].command, RESET_CHAT);
        assert_eq!(replay[0].content["uid"], "c1");
        assert_eq!(replay[1].command, CHAT_REQUEST);
        assert!(replay[1].is_history);
        assert_eq!(replay[1].role, Some(Role::User));
        let images = replay[1].images.as_ref().unwrap();
        assert_eq!(images.len(), 1);
        assert!(images[0].starts_with("file://"));
        assert_eq!(replay[2].role, Some(Role::Bot));
        assert!(replay[2].images.is_none());
    }

    #[tokio::test]
    async fn test_load_unknown_chat_emits_nothing() {
        let s = session(FakeBackend::replying("x"));
        s.handler
            .handle(InboundCommand::LoadChat {
                chat_id: "missing".into(),
            })
            .await;
        assert!(s.sink.events().is_empty());
    }
}
