//! Turn processing: attachments, history, model choice, and the chain of
//! system-prompt steps that produces the assistant reply.

use crate::attachments::{AttachmentError, AttachmentStore};
use crate::captioning::ImageCaptioner;
use crate::db::models::{ContextEntry, Message, Role};
use crate::db::{Database, StoreError};
use crate::llm::capabilities::{effective_temperature, is_vision_capable};
use crate::llm::{ChatBackend, ChatMessage, ChatRequest, ContentPart, LlmError, MessageContent};
use crate::settings::{AppSettings, DEFAULT_SYSTEM_PROMPT};
use futures::future::join_all;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info};

/// Reply stored and shown when a turn fails.
pub const APOLOGY_REPLY: &str = "Sorry, I could not process your request at this time.";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub data_url: String,
    #[serde(default)]
    pub name: String,
}

/// One user turn as handed over by the protocol layer. File-context blocks are
/// already merged into `text`.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub chat_id: String,
    pub text: String,
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStep {
    pub name: String,
    pub system_prompt: String,
    pub order: i64,
}

/// Active prompt definitions in ascending order; never empty.
pub fn resolve_steps(settings: &AppSettings) -> Vec<PipelineStep> {
    let mut steps: Vec<PipelineStep> = settings
        .prompts
        .iter()
        .filter(|p| p.is_active)
        .map(|p| PipelineStep {
            name: p.name.clone(),
            system_prompt: p.content.clone(),
            order: p.order,
        })
        .collect();
    steps.sort_by_key(|s| s.order);

    if steps.is_empty() {
        let system_prompt = if settings.general.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            settings.general.system_prompt.clone()
        };
        steps.push(PipelineStep {
            name: "default".into(),
            system_prompt,
            order: 0,
        });
    }
    steps
}

/// Stored form of one attached image plus what the model may receive.
#[derive(Debug, Clone)]
struct PreparedImage {
    filename: String,
    description: String,
    part: ContentPart,
}

/// Model choice and current-turn content for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedTurn {
    pub model: String,
    pub content: MessageContent,
}

/// Picks the target model and shapes the current turn:
/// no images -> text model, plain text;
/// images and a vision-capable image model -> image model, text part then one
/// image part per attachment;
/// images otherwise -> text model, text followed by numbered captions.
pub fn shape_turn(
    settings: &AppSettings,
    text: &str,
    image_parts: Vec<ContentPart>,
    descriptions: &[String],
) -> ShapedTurn {
    if image_parts.is_empty() {
        return ShapedTurn {
            model: settings.text_model(),
            content: MessageContent::Text(text.to_string()),
        };
    }

    let vision_model = settings.image_model();
    if is_vision_capable(settings.models.provider, &vision_model) {
        let mut parts = Vec::with_capacity(image_parts.len() + 1);
        parts.push(ContentPart::text(text));
        parts.extend(image_parts);
        return ShapedTurn {
            model: vision_model,
            content: MessageContent::Parts(parts),
        };
    }

    ShapedTurn {
        model: settings.text_model(),
        content: MessageContent::Text(with_image_descriptions(text, descriptions)),
    }
}

/// `text` followed by one numbered `[Image N Description: ...]` block per
/// caption.
pub fn with_image_descriptions(text: &str, descriptions: &[String]) -> String {
    let mut content = text.to_string();
    for (index, description) in descriptions.iter().enumerate() {
        content.push_str(&format!("\n\n[Image {} Description: {}]", index + 1, description));
    }
    content
}

/// Model-facing form of a stored window entry. Earlier images are replayed
/// through their cached captions.
fn history_message(entry: &ContextEntry) -> ChatMessage {
    let content = match entry.role {
        Role::User => with_image_descriptions(&entry.content, &entry.image_descriptions),
        Role::Bot => entry.content.clone(),
    };
    ChatMessage {
        role: entry.role.api_role().to_string(),
        content: MessageContent::Text(content),
    }
}

/// Drops the trailing window entry when it is the message just stored; that
/// turn is sent separately in its multimodal form.
pub fn strip_current_turn(mut window: Vec<ContextEntry>, current: &Message) -> Vec<ContextEntry> {
    if window.last().is_some_and(|e| e.message_id == current.id) {
        window.pop();
    }
    window
}

/// One async lock per conversation id so turns on the same conversation run
/// one after another.
#[derive(Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forgets the lock for `chat_id` once no turn holds or awaits it.
    fn release(&self, chat_id: &str) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(chat_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(chat_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

pub struct PromptPipeline {
    db: Arc<Database>,
    attachments: Arc<AttachmentStore>,
    captioner: ImageCaptioner,
    backend: Arc<dyn ChatBackend>,
    locks: ConversationLocks,
}

impl PromptPipeline {
    pub fn new(
        db: Arc<Database>,
        attachments: Arc<AttachmentStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            db,
            attachments,
            captioner: ImageCaptioner::new(backend.clone()),
            backend,
            locks: ConversationLocks::default(),
        }
    }

    /// Runs one turn and returns the assistant reply. Always appends exactly
    /// one bot message; on failure that message is [`APOLOGY_REPLY`].
    pub async fn process_turn(&self, turn: TurnInput) -> String {
        let guard = self.locks.acquire(&turn.chat_id).await;

        let reply = match self.run_turn(&turn).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(chat_id = %turn.chat_id, error = %e, "chat turn failed");
                if let Err(store_err) =
                    self.db
                        .append_message(&turn.chat_id, Role::Bot, APOLOGY_REPLY, &[], &[])
                {
                    error!(chat_id = %turn.chat_id, error = %store_err, "could not store apology reply");
                }
                APOLOGY_REPLY.to_string()
            }
        };

        drop(guard);
        self.locks.release(&turn.chat_id);
        reply
    }

    async fn run_turn(&self, turn: &TurnInput) -> Result<String, PipelineError> {
        let settings = self.db.load_settings()?;

        let prepared = self.prepare_images(&settings, &turn.images).await?;
        let (filenames, descriptions, parts) = prepared.into_iter().fold(
            (Vec::new(), Vec::new(), Vec::new()),
            |(mut names, mut descs, mut parts), image| {
                names.push(image.filename);
                descs.push(image.description);
                parts.push(image.part);
                (names, descs, parts)
            },
        );

        let user_message = self.db.append_message(
            &turn.chat_id,
            Role::User,
            &turn.text,
            &filenames,
            &descriptions,
        )?;

        let window = self
            .db
            .recent_window(&turn.chat_id, settings.general.max_context_messages)?;
        let window = strip_current_turn(window, &user_message);

        let shaped = shape_turn(&settings, &turn.text, parts, &descriptions);
        info!(
            chat_id = %turn.chat_id,
            model = %shaped.model,
            images = filenames.len(),
            context = window.len(),
            "processing chat turn"
        );

        let reply = self.run_steps(&settings, &window, shaped).await?;

        self.db
            .append_message(&turn.chat_id, Role::Bot, &reply, &[], &[])?;
        Ok(reply)
    }

    /// Saves and captions every image concurrently and waits for all of them.
    /// A failed caption degrades locally; a failed save fails the turn.
    async fn prepare_images(
        &self,
        settings: &AppSettings,
        images: &[ImageAttachment],
    ) -> Result<Vec<PreparedImage>, PipelineError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let tasks = images.iter().map(|image| async move {
            let (saved, description) = futures::join!(
                self.attachments.save_image(&image.data_url),
                self.captioner.describe_image(settings, &image.data_url),
            );
            Ok::<_, PipelineError>(PreparedImage {
                filename: saved?,
                description,
                part: ContentPart::image(image.data_url.clone()),
            })
        });
        join_all(tasks).await.into_iter().collect()
    }

    /// Runs the steps strictly in sequence; each step's reply becomes the next
    /// step's user turn.
    async fn run_steps(
        &self,
        settings: &AppSettings,
        window: &[ContextEntry],
        shaped: ShapedTurn,
    ) -> Result<String, PipelineError> {
        let steps = resolve_steps(settings);
        let endpoint = settings.endpoint();
        let temperature = effective_temperature(&shaped.model, settings.general.temperature);
        let history: Vec<ChatMessage> = window.iter().map(history_message).collect();

        let mut running = shaped.content;
        for (index, step) in steps.iter().enumerate() {
            let mut messages = Vec::with_capacity(history.len() + 2);
            messages.push(ChatMessage::system(step.system_prompt.clone()));
            messages.extend(history.iter().cloned());
            messages.push(ChatMessage::user(running));

            let request = ChatRequest {
                messages,
                model: shaped.model.clone(),
                temperature,
                endpoint: endpoint.clone(),
            };
            debug!(step = %step.name, index, model = %request.model, "running pipeline step");
            let response = self.backend.chat_completion(&request).await?;
            running = MessageContent::Text(response.content);
        }

        Ok(running.text())
    }
}
