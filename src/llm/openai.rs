use super::{ChatMessage, ChatRequest, ChatResponse, Endpoint, LlmError, ProviderKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiReply,
}

#[derive(Deserialize)]
struct OpenAiReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Deserialize)]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
}

#[derive(Deserialize)]
struct GeminiModel {
    name: String,
}

/// Gemini serves its OpenAI-compatible surface under `/openai`.
pub fn chat_completions_url(endpoint: &Endpoint) -> String {
    match endpoint.provider {
        ProviderKind::OpenAI => format!("{}/chat/completions", endpoint.base_url()),
        ProviderKind::Gemini => format!("{}/openai/chat/completions", endpoint.base_url()),
    }
}

pub async fn chat(client: &Client, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
    let body = OpenAiRequest {
        model: &request.model,
        messages: &request.messages,
        temperature: request.temperature,
        stream: false,
    };

    let url = chat_completions_url(&request.endpoint);
    debug!(%url, model = %request.model, messages = request.messages.len(), "sending chat completion");

    let mut req = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(&body);

    if !request.endpoint.api_key.is_empty() {
        req = req.header(
            "Authorization",
            format!("Bearer {}", request.endpoint.api_key),
        );
    }

    let resp = req.send().await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let data: OpenAiResponse = resp.json().await?;
    let content = data
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Parse("response contained no choices".into()))?
        .message
        .content
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        model: request.model.clone(),
    })
}

pub async fn list_models(client: &Client, endpoint: &Endpoint) -> Result<Vec<String>, LlmError> {
    let url = format!("{}/models", endpoint.base_url());
    debug!(%url, "fetching OpenAI models");

    let resp = client
        .get(url)
        .header("Authorization", format!("Bearer {}", endpoint.api_key))
        .header("Content-Type", "application/json")
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let data: OpenAiModelList = resp.json().await?;
    Ok(data.data.into_iter().map(|m| m.id).collect())
}

/// Gemini's native listing; names come back as `models/<id>`.
pub async fn list_gemini_models(
    client: &Client,
    endpoint: &Endpoint,
) -> Result<Vec<String>, LlmError> {
    let url = format!("{}/models", endpoint.base_url());
    debug!(%url, "fetching Gemini models");

    let resp = client
        .get(url)
        .query(&[("key", endpoint.api_key.as_str())])
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let data: GeminiModelList = resp.json().await?;
    Ok(data
        .models
        .into_iter()
        .map(|m| m.name.trim_start_matches("models/").to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_per_provider() {
        let openai = Endpoint {
            provider: ProviderKind::OpenAI,
            api_key: "k".into(),
            base_url: None,
        };
        assert_eq!(
            chat_completions_url(&openai),
            "https://api.openai.com/v1/chat/completions"
        );

        let gemini = Endpoint {
            provider: ProviderKind::Gemini,
            api_key: "k".into(),
            base_url: None,
        };
        assert_eq!(
            chat_completions_url(&gemini),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn test_reply_with_null_content_parses() {
        let data: OpenAiResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#)
                .unwrap();
        assert!(data.choices[0].message.content.is_none());
    }
}
