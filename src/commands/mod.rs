//! Session protocol: inbound front-end commands, outbound events, and the
//! handler that routes one to the other.

pub mod chat;
pub mod context;
pub mod history;
pub mod settings;

use crate::attachments::AttachmentStore;
use crate::db::models::Role;
use crate::db::{Database, StoreError};
use crate::doc_processor::ContextError;
use crate::llm::{ChatBackend, ProviderKind};
use crate::pipeline::{ImageAttachment, PromptPipeline};
use crate::settings::AppSettings;
use context::EditorHost;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

// Wire command names.
pub const WEBVIEW_READY: &str = "ChatWebviewReady";
pub const RESET_CHAT: &str = "resetChat";
pub const CHAT_REQUEST: &str = "chatRequest";
pub const LOAD_CHAT: &str = "loadChat";
pub const LOAD_HISTORY: &str = "loadHistory";
pub const CLEAR_HISTORY: &str = "clearHistory";
pub const DELETE_HISTORY_ITEM: &str = "deleteHistoryItem";
pub const SEARCH_HISTORY: &str = "searchHistory";
pub const ADD_CONTEXT: &str = "addContext";
pub const FILE_CONTEXT_ADDED: &str = "fileContextAdded";
pub const LOAD_SETTINGS: &str = "loadSettings";
pub const SETTINGS_LOADED: &str = "settingsLoaded";
pub const SAVE_SETTINGS: &str = "saveSettings";
pub const SETTINGS_SAVED: &str = "settingsSaved";
pub const RESET_SETTINGS: &str = "resetSettings";
pub const FETCH_MODELS: &str = "fetchModels";
pub const UPDATE_MODEL_LIST: &str = "updateModelList";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed command: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContext {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatRequestPayload {
    pub message: String,
    #[serde(default, alias = "chatId")]
    pub chat_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub files: Vec<FileContext>,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextKind {
    CurrentFile,
    Selection,
    PickFile,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddContextPayload {
    #[serde(rename = "type")]
    pub kind: ContextKind,
    /// Files chosen by the front end; when empty the editor's picker is used.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchModelsPayload {
    pub provider: ProviderKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    WebviewReady,
    ResetChat,
    ChatRequest(ChatRequestPayload),
    LoadChat { chat_id: String },
    LoadHistory,
    ClearHistory,
    DeleteHistoryItem { chat_id: String },
    SearchHistory { query: String },
    AddContext(AddContextPayload),
    LoadSettings,
    SaveSettings(Box<AppSettings>),
    ResetSettings,
    FetchModels(FetchModelsPayload),
}

#[derive(Deserialize)]
struct RawCommand {
    command: String,
    #[serde(default, alias = "content")]
    data: Value,
}

#[derive(Deserialize)]
struct ChatIdPayload {
    #[serde(rename = "chatId", alias = "chat_id")]
    chat_id: String,
}

#[derive(Deserialize)]
struct SearchPayload {
    #[serde(default)]
    query: String,
}

#[derive(Deserialize)]
struct SaveSettingsPayload {
    settings: AppSettings,
}

impl InboundCommand {
    /// Parses one JSON message `{command, data}` from the front end.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let RawCommand { command, data } = serde_json::from_str(raw)?;
        let parsed = match command.as_str() {
            WEBVIEW_READY => Self::WebviewReady,
            RESET_CHAT => Self::ResetChat,
            CHAT_REQUEST => Self::ChatRequest(serde_json::from_value(data)?),
            LOAD_CHAT => {
                let payload: ChatIdPayload = serde_json::from_value(data)?;
                Self::LoadChat {
                    chat_id: payload.chat_id,
                }
            }
            LOAD_HISTORY => Self::LoadHistory,
            CLEAR_HISTORY => Self::ClearHistory,
            DELETE_HISTORY_ITEM => {
                let payload: ChatIdPayload = serde_json::from_value(data)?;
                Self::DeleteHistoryItem {
                    chat_id: payload.chat_id,
                }
            }
            SEARCH_HISTORY => {
                let payload: SearchPayload = serde_json::from_value(data)?;
                Self::SearchHistory {
                    query: payload.query,
                }
            }
            ADD_CONTEXT => Self::AddContext(serde_json::from_value(data)?),
            LOAD_SETTINGS => Self::LoadSettings,
            SAVE_SETTINGS => {
                let payload: SaveSettingsPayload = serde_json::from_value(data)?;
                Self::SaveSettings(Box::new(payload.settings))
            }
            RESET_SETTINGS => Self::ResetSettings,
            FETCH_MODELS => Self::FetchModels(serde_json::from_value(data)?),
            _ => return Err(ProtocolError::UnknownCommand(command)),
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WebviewReady => WEBVIEW_READY,
            Self::ResetChat => RESET_CHAT,
            Self::ChatRequest(_) => CHAT_REQUEST,
            Self::LoadChat { .. } => LOAD_CHAT,
            Self::LoadHistory => LOAD_HISTORY,
            Self::ClearHistory => CLEAR_HISTORY,
            Self::DeleteHistoryItem { .. } => DELETE_HISTORY_ITEM,
            Self::SearchHistory { .. } => SEARCH_HISTORY,
            Self::AddContext(_) => ADD_CONTEXT,
            Self::LoadSettings => LOAD_SETTINGS,
            Self::SaveSettings(_) => SAVE_SETTINGS,
            Self::ResetSettings => RESET_SETTINGS,
            Self::FetchModels(_) => FETCH_MODELS,
        }
    }
}

/// One message to the front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub command: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_history: bool,
}

impl OutboundEvent {
    pub fn new(command: &str, content: Value) -> Self {
        Self {
            command: command.to_string(),
            content,
            role: None,
            images: None,
            is_history: false,
        }
    }

    /// A chat bubble for `role`.
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            ..Self::new(CHAT_REQUEST, Value::String(content.into()))
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        if !images.is_empty() {
            self.images = Some(images);
        }
        self
    }

    pub fn replayed(mut self) -> Self {
        self.is_history = true;
        self
    }
}

/// The connected front-end view.
pub trait EventSink: Send + Sync {
    fn post(&self, event: OutboundEvent);
}

/// Forwards events to a channel drained by the transport writer.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn post(&self, event: OutboundEvent) {
        if self.tx.send(event).is_err() {
            debug!("event writer closed, dropping event");
        }
    }
}

/// Routes inbound commands to the stores and the prompt pipeline. Every
/// collaborator is injected; nothing is read from global state.
pub struct SessionHandler {
    db: Arc<Database>,
    attachments: Arc<AttachmentStore>,
    backend: Arc<dyn ChatBackend>,
    pipeline: PromptPipeline,
    editor: Arc<dyn EditorHost>,
    view: RwLock<Option<Arc<dyn EventSink>>>,
}

impl SessionHandler {
    pub fn new(
        db: Arc<Database>,
        attachments: Arc<AttachmentStore>,
        backend: Arc<dyn ChatBackend>,
        editor: Arc<dyn EditorHost>,
    ) -> Self {
        let pipeline = PromptPipeline::new(db.clone(), attachments.clone(), backend.clone());
        Self {
            db,
            attachments,
            backend,
            pipeline,
            editor,
            view: RwLock::new(None),
        }
    }

    pub fn attach_view(&self, sink: Arc<dyn EventSink>) {
        *self.view.write().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    pub fn detach_view(&self) {
        *self.view.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn view(&self) -> Option<Arc<dyn EventSink>> {
        self.view.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Handles one command. Without a connected view the command is dropped
    /// before anything is read or written.
    pub async fn handle(&self, command: InboundCommand) {
        let name = command.name();
        let Some(view) = self.view() else {
            warn!(command = name, "no active view, command dropped");
            return;
        };
        debug!(command = name, "handling command");
        if let Err(e) = self.dispatch(view.as_ref(), command).await {
            error!(command = name, error = %e, "command failed");
        }
    }

    async fn dispatch(
        &self,
        view: &dyn EventSink,
        command: InboundCommand,
    ) -> Result<(), ProtocolError> {
        match command {
            InboundCommand::WebviewReady => {
                self.reset_chat(view);
                self.load_history(view)
            }
            InboundCommand::ResetChat => {
                self.reset_chat(view);
                Ok(())
            }
            InboundCommand::ChatRequest(payload) => self.send_message(view, payload).await,
            InboundCommand::LoadChat { chat_id } => self.load_chat(view, &chat_id),
            InboundCommand::LoadHistory => self.load_history(view),
            InboundCommand::ClearHistory => self.clear_history(view).await,
            InboundCommand::DeleteHistoryItem { chat_id } => {
                self.delete_history_item(view, &chat_id).await
            }
            InboundCommand::SearchHistory { query } => self.search_history(view, &query),
            InboundCommand::AddContext(payload) => self.add_context(view, payload).await,
            InboundCommand::LoadSettings => self.load_settings(view),
            InboundCommand::SaveSettings(settings) => self.save_settings(view, *settings),
            InboundCommand::ResetSettings => self.reset_settings(view),
            InboundCommand::FetchModels(payload) => self.fetch_models(view, payload).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::llm::testing::FakeBackend;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<OutboundEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<OutboundEvent> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.events().into_iter().map(|e| e.command).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn post(&self, event: OutboundEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    pub(crate) struct Session {
        pub(crate) handler: SessionHandler,
        pub(crate) db: Arc<Database>,
        pub(crate) sink: Arc<RecordingSink>,
        pub(crate) backend: Arc<FakeBackend>,
        pub(crate) dir: tempfile::TempDir,
    }

    pub(crate) fn session_with(backend: FakeBackend, editor: Arc<dyn EditorHost>) -> Session {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let attachments = Arc::new(AttachmentStore::new(dir.path().join("images")).unwrap());
        let backend = Arc::new(backend);
        let handler = SessionHandler::new(db.clone(), attachments, backend.clone(), editor);
        let sink = Arc::new(RecordingSink::default());
        handler.attach_view(sink.clone());
        Session {
            handler,
            db,
            sink,
            backend,
            dir,
        }
    }

    pub(crate) fn session(backend: FakeBackend) -> Session {
        session_with(backend, Arc::new(context::DetachedEditor))
    }
}
