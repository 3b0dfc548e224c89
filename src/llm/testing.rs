use super::{ChatBackend, ChatRequest, ChatResponse, Endpoint, LlmError};
use async_trait::async_trait;
use std::sync::Mutex;

type Responder = dyn Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync;

/// Scripted backend that records every request it receives.
pub(crate) struct FakeBackend {
    responder: Box<Responder>,
    models: Vec<String>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeBackend {
    pub(crate) fn new(
        responder: impl Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            models: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies with `reply` to everything.
    pub(crate) fn replying(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_| Ok(reply.clone()))
    }

    pub(crate) fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let content = (self.responder)(request)?;
        Ok(ChatResponse {
            content,
            model: request.model.clone(),
        })
    }

    async fn list_models(&self, _endpoint: &Endpoint) -> Result<Vec<String>, LlmError> {
        Ok(self.models.clone())
    }
}
