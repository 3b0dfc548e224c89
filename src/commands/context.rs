use super::{
    AddContextPayload, ContextKind, EventSink, OutboundEvent, ProtocolError, SessionHandler,
    FILE_CONTEXT_ADDED,
};
use crate::doc_processor::{self, ContextError};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A document or selection read from the host editor.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorDocument {
    pub name: String,
    pub text: String,
    pub language: String,
}

/// Editor-side reads used by the add-context commands.
#[async_trait]
pub trait EditorHost: Send + Sync {
    fn active_document(&self) -> Option<EditorDocument>;
    fn active_selection(&self) -> Option<EditorDocument>;
    /// Lets the user choose files; empty when cancelled.
    async fn pick_files(&self) -> Vec<PathBuf>;
}

/// Host with no editor attached. Only explicit paths work.
pub struct DetachedEditor;

#[async_trait]
impl EditorHost for DetachedEditor {
    fn active_document(&self) -> Option<EditorDocument> {
        None
    }

    fn active_selection(&self) -> Option<EditorDocument> {
        None
    }

    async fn pick_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

fn file_event(doc: &EditorDocument) -> OutboundEvent {
    OutboundEvent::new(
        FILE_CONTEXT_ADDED,
        json!({
            "name": doc.name,
            "text": doc.text,
            "language": doc.language,
            "type": "file",
        }),
    )
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Reads one picked path into its context event. Images become data URLs,
/// everything else is extracted as text.
fn read_picked(path: &Path) -> Result<OutboundEvent, ContextError> {
    let name = display_name(path);
    if doc_processor::is_image(path) {
        let data_url = doc_processor::image_data_url(path)?;
        return Ok(OutboundEvent::new(
            FILE_CONTEXT_ADDED,
            json!({ "name": name, "dataUrl": data_url, "type": "image" }),
        ));
    }
    let parsed = doc_processor::parse_file(path)?;
    Ok(file_event(&EditorDocument {
        name,
        text: parsed.content,
        language: parsed.language,
    }))
}

impl SessionHandler {
    pub(super) async fn add_context(
        &self,
        view: &dyn EventSink,
        payload: AddContextPayload,
    ) -> Result<(), ProtocolError> {
        match payload.kind {
            ContextKind::CurrentFile => {
                let doc = self
                    .editor
                    .active_document()
                    .ok_or(ContextError::NoActiveEditor)?;
                view.post(file_event(&doc));
            }
            ContextKind::Selection => {
                let doc = self
                    .editor
                    .active_selection()
                    .filter(|d| !d.text.is_empty())
                    .ok_or(ContextError::NoActiveEditor)?;
                view.post(file_event(&doc));
            }
            ContextKind::PickFile => {
                let paths = if payload.paths.is_empty() {
                    self.editor.pick_files().await
                } else {
                    payload.paths
                };
                for path in &paths {
                    match read_picked(path) {
                        Ok(event) => view.post(event),
                        Err(e) => warn!(path = %path.display(), error = %e, "skipping context file"),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::InboundCommand;
    use super::*;
    use crate::llm::testing::FakeBackend;
    use std::sync::Arc;

    struct OpenEditor {
        picked: Vec<PathBuf>,
    }

    #[async_trait]
    impl EditorHost for OpenEditor {
        fn active_document(&self) -> Option<EditorDocument> {
            Some(EditorDocument {
                name: "main.rs".into(),
                text: "fn main() {}".into(),
                language: "rust".into(),
            })
        }

        fn active_selection(&self) -> Option<EditorDocument> {
            Some(EditorDocument {
                name: "main.rs".into(),
                text: "main".into(),
                language: "rust".into(),
            })
        }

        async fn pick_files(&self) -> Vec<PathBuf> {
            self.picked.clone()
        }
    }

    fn add(kind: ContextKind, paths: Vec<PathBuf>) -> InboundCommand {
        InboundCommand::AddContext(AddContextPayload { kind, paths })
    }

    #[tokio::test]
    async fn test_current_file_and_selection() {
        let s = session_with(
            FakeBackend::replying("x"),
            Arc::new(OpenEditor { picked: vec![] }),
        );
        s.handler.handle(add(ContextKind::CurrentFile, vec![])).await;
        s.handler.handle(add(ContextKind::Selection, vec![])).await;

        let events = s.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].content,
            json!({"name": "main.rs", "text": "fn main() {}", "language": "rust", "type": "file"})
        );
        assert_eq!(events[1].content["text"], "main");
    }

    #[tokio::test]
    async fn test_picked_files_skip_unreadable() {
        let s = session(FakeBackend::replying("x"));
        let code = s.dir.path().join("util.py");
        std::fs::write(&code, "def f(): pass").unwrap();
        let image = s.dir.path().join("shot.png");
        std::fs::write(&image, b"hello").unwrap();
        let missing = s.dir.path().join("gone.txt");

        s.handler
            .handle(add(ContextKind::PickFile, vec![code, missing, image]))
            .await;

        let events = s.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].command, FILE_CONTEXT_ADDED);
        assert_eq!(events[0].content["language"], "python");
        assert_eq!(events[1].content["type"], "image");
        assert_eq!(events[1].content["dataUrl"], "data:image/png;base64,aGVsbG8=");
    }

    #[tokio::test]
    async fn test_picker_used_when_no_paths_given() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.md");
        std::fs::write(&notes, "# hi").unwrap();
        let s = session_with(
            FakeBackend::replying("x"),
            Arc::new(OpenEditor {
                picked: vec![notes],
            }),
        );
        s.handler.handle(add(ContextKind::PickFile, vec![])).await;
        let events = s.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content["name"], "notes.md");
        assert_eq!(events[0].content["language"], "markdown");
    }

    #[tokio::test]
    async fn test_no_editor_emits_nothing() {
        let s = session(FakeBackend::replying("x"));
        s.handler.handle(add(ContextKind::CurrentFile, vec![])).await;
        assert!(s.sink.events().is_empty());
    }
}
