//! Local model backend.
//!
//! The worker speaks the OpenAI-compatible `/chat/completions` dialect, which
//! Ollama, llama.cpp, LM Studio and vLLM all serve.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{AiRequestPayload, AiResponsePayload};
use tracing::debug;

use crate::error::WorkerError;

/// Backend error bodies are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 300;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &AiRequestPayload) -> Result<AiResponsePayload, WorkerError>;

    /// Short description of where completions come from, sent at registration.
    fn endpoint(&self) -> String;

    fn model(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiCompatBackend {
    http_client: Client,
    base_url: String,
    model: Option<String>,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    async fn complete(&self, request: &AiRequestPayload) -> Result<AiResponsePayload, WorkerError> {
        let model = request
            .payload
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.model.clone())
            .ok_or_else(|| {
                WorkerError::Backend(
                    "no model configured; set LOCAL_PROXY_BACKEND_MODEL".to_string(),
                )
            })?;

        let body = CompletionRequest {
            model: &model,
            messages: build_messages(&request.action, &request.payload),
            stream: false,
            temperature: request.payload.get("temperature").and_then(Value::as_f64),
            max_tokens: request.payload.get("maxTokens").and_then(Value::as_u64),
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %model, action = %request.action, "calling local backend");

        let mut builder = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let snippet: String = error_text.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(WorkerError::Backend(format!(
                "backend returned {status}: {snippet}"
            )));
        }

        let completion = response.json::<CompletionResponse>().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| WorkerError::Backend("backend returned no choices".to_string()))?;

        let structured = parse_structured(&content);
        let description = structured
            .as_ref()
            .and_then(|v| v.get("description"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(AiResponsePayload {
            content,
            description,
            model: completion.model.or(Some(model)),
            structured,
        })
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    fn model(&self) -> Option<String> {
        self.model.clone()
    }
}

/// Turn an opaque `ai_request` payload into chat messages.
///
/// Precedence: an explicit `messages` array, then `systemPrompt` /
/// `userPrompt` (or `prompt`), then the whole payload as the user turn.
pub fn build_messages(action: &str, payload: &Value) -> Vec<ChatMessage> {
    if let Some(messages) = payload
        .get("messages")
        .and_then(|m| serde_json::from_value::<Vec<ChatMessage>>(m.clone()).ok())
        .filter(|m| !m.is_empty())
    {
        return messages;
    }

    let text = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let mut messages = Vec::new();
    if let Some(system) = text("systemPrompt") {
        messages.push(ChatMessage::new("system", system));
    }
    match text("userPrompt").or_else(|| text("prompt")) {
        Some(user) => messages.push(ChatMessage::new("user", user)),
        None => {
            if messages.is_empty() {
                messages.push(ChatMessage::new(
                    "system",
                    format!("You are handling a `{action}` request. Respond to the JSON input."),
                ));
            }
            messages.push(ChatMessage::new("user", payload.to_string()));
        }
    }
    messages
}

/// Completion content parsed as JSON, when it is a JSON object or array.
/// Tolerates a surrounding markdown code fence.
pub fn parse_structured(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str::<Value>(unfenced)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_messages_win() {
        let payload = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "prompt": "ignored",
        });
        let messages = build_messages("chat", &payload);
        assert_eq!(messages, vec![ChatMessage::new("user", "hi")]);
    }

    #[test]
    fn test_system_and_user_prompts() {
        let payload = json!({"systemPrompt": "Be terse.", "userPrompt": "Plan a trip"});
        let messages = build_messages("generate_task", &payload);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ChatMessage::new("system", "Be terse."));
        assert_eq!(messages[1], ChatMessage::new("user", "Plan a trip"));
    }

    #[test]
    fn test_prompt_alias() {
        let messages = build_messages("generate_task", &json!({"prompt": "Buy milk"}));
        assert_eq!(messages, vec![ChatMessage::new("user", "Buy milk")]);
    }

    #[test]
    fn test_raw_payload_fallback() {
        let payload = json!({"title": "Release", "items": 3});
        let messages = build_messages("summarize", &payload);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("summarize"));
        let echoed: Value = serde_json::from_str(&messages[1].content).unwrap();
        assert_eq!(echoed, payload);
    }

    #[test]
    fn test_parse_structured() {
        assert_eq!(
            parse_structured("```json\n{\"a\": 1}\n```"),
            Some(json!({"a": 1}))
        );
        assert_eq!(parse_structured("[1, 2]"), Some(json!([1, 2])));
        assert_eq!(parse_structured("\"just a string\""), None);
        assert_eq!(parse_structured("- [ ] Buy milk"), None);
    }
}
