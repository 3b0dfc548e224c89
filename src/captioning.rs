use crate::llm::capabilities::{effective_temperature, is_vision_capable, static_catalog};
use crate::llm::{ChatBackend, ChatMessage, ChatRequest, ContentPart, MessageContent};
use crate::settings::AppSettings;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CAPTION_PROMPT: &str = "Describe this image in detail for a coding assistant context. Focus on code, errors, UI elements, or diagrams visible.";

/// Stored in place of a description when the vision call fails.
pub const CAPTION_FAILED: &str = "Failed to generate image description.";

/// Stored when the vision call succeeds but returns nothing.
pub const CAPTION_UNAVAILABLE: &str = "Image description unavailable.";

const CAPTION_TEMPERATURE: f32 = 0.3;

/// Produces short text stand-ins for images via a vision model.
pub struct ImageCaptioner {
    backend: Arc<dyn ChatBackend>,
}

/// The configured image model when it can read images, else the provider's
/// first built-in vision model.
pub fn caption_model(settings: &AppSettings) -> String {
    let provider = settings.models.provider;
    let configured = settings.image_model();
    if is_vision_capable(provider, &configured) {
        return configured;
    }
    static_catalog(provider)
        .image_models
        .into_iter()
        .next()
        .unwrap_or(configured)
}

impl ImageCaptioner {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Never fails: any error becomes [`CAPTION_FAILED`].
    pub async fn describe_image(&self, settings: &AppSettings, data_url: &str) -> String {
        let model = caption_model(settings);
        let temperature = effective_temperature(&model, CAPTION_TEMPERATURE);
        let request = ChatRequest {
            messages: vec![ChatMessage::user(MessageContent::Parts(vec![
                ContentPart::text(CAPTION_PROMPT),
                ContentPart::image(data_url),
            ]))],
            model,
            temperature,
            endpoint: settings.endpoint(),
        };

        match self.backend.chat_completion(&request).await {
            Ok(response) if response.content.trim().is_empty() => CAPTION_UNAVAILABLE.to_string(),
            Ok(response) => {
                debug!(model = %request.model, chars = response.content.len(), "image described");
                response.content
            }
            Err(e) => {
                warn!(model = %request.model, error = %e, "failed to describe image");
                CAPTION_FAILED.to_string()
            }
        }
    }
}
