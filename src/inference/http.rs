//! OpenAI-compatible chat-completions transport
//!
//! Talks to any server exposing `POST {base}/chat/completions` (vLLM,
//! llama.cpp server, hosted APIs). The task directive goes in the system
//! message and the document text in the user message.

use super::{InferenceClient, InferenceError, InferenceReply, InvokeOptions, TaskKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Connection settings for [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Directive overrides; kinds not present use [`TaskKind::default_directive`].
    pub directives: HashMap<TaskKind, String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// HTTP client for an OpenAI-compatible inference server.
pub struct ChatClient {
    http: reqwest::Client,
    settings: ChatSettings,
}

impl ChatClient {
    pub fn new(settings: ChatSettings) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| InferenceError::Unavailable(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn directive(&self, kind: TaskKind) -> &str {
        self.settings
            .directives
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_directive())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn transport_error(err: reqwest::Error, options: &InvokeOptions) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout(options.timeout)
        } else {
            InferenceError::Unavailable(err.to_string())
        }
    }
}

/// Turn a parsed chat response into a reply, classifying unusable output as a refusal.
fn interpret(response: ChatResponse) -> Result<InferenceReply, InferenceError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::Refusal("response contained no choices".to_string()))?;

    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(InferenceError::Refusal(refusal));
    }
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(InferenceError::Refusal("output blocked by content filter".to_string()));
    }

    let text = choice.message.content.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(InferenceError::Refusal("empty response".to_string()));
    }

    Ok(InferenceReply {
        text,
        metadata: serde_json::json!({
            "model": response.model,
            "usage": response.usage,
        }),
    })
}

#[async_trait]
impl InferenceClient for ChatClient {
    async fn is_available(&self) -> bool {
        let request = self.authorize(self.http.get(self.endpoint("models")));
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn invoke(
        &self,
        kind: TaskKind,
        text: &str,
        options: &InvokeOptions,
    ) -> Result<InferenceReply, InferenceError> {
        let body = ChatRequest {
            model: &self.settings.model,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            messages: [
                ChatMessage {
                    role: "system",
                    content: self.directive(kind),
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
        };

        let request = self
            .authorize(self.http.post(self.endpoint("chat/completions")))
            .timeout(options.timeout)
            .json(&body);

        let resp = request
            .send()
            .await
            .map_err(|e| Self::transport_error(e, options))?;
        let status = resp.status();
        debug!(task = %kind, status = status.as_u16(), "chat completion returned");

        if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
            return Err(InferenceError::Unavailable(format!("server returned {}", status)));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Refusal(format!(
                "request declined with {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Refusal(format!("unparseable response: {}", e)))?;
        interpret(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ChatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn interpret_returns_first_choice_text() {
        let reply = interpret(parse(
            r#"{"model":"local","choices":[{"message":{"content":"hello"},"finish_reason":"stop"}]}"#,
        ))
        .unwrap();
        assert_eq!(reply.text, "hello");
        assert_eq!(reply.metadata["model"], "local");
    }

    #[test]
    fn interpret_classifies_empty_and_filtered_output_as_refusal() {
        let empty = interpret(parse(r#"{"choices":[{"message":{"content":"  "}}]}"#));
        assert!(matches!(empty, Err(InferenceError::Refusal(_))));

        let filtered = interpret(parse(
            r#"{"choices":[{"message":{"content":"x"},"finish_reason":"content_filter"}]}"#,
        ));
        assert!(matches!(filtered, Err(InferenceError::Refusal(_))));

        let refused = interpret(parse(
            r#"{"choices":[{"message":{"content":null,"refusal":"cannot help"}}]}"#,
        ));
        assert_eq!(refused.unwrap_err(), InferenceError::Refusal("cannot help".to_string()));

        let none = interpret(parse(r#"{"choices":[]}"#));
        assert!(matches!(none, Err(InferenceError::Refusal(_))));
    }

    #[test]
    fn directive_override_takes_precedence() {
        let mut directives = HashMap::new();
        directives.insert(TaskKind::Plot, "custom plot directive".to_string());
        let client = ChatClient::new(ChatSettings {
            base_url: "http://localhost:8000/v1/".to_string(),
            model: "local".to_string(),
            api_key: None,
            temperature: 0.4,
            max_tokens: 2000,
            directives,
        })
        .unwrap();

        assert_eq!(client.directive(TaskKind::Plot), "custom plot directive");
        assert_eq!(
            client.directive(TaskKind::Character),
            TaskKind::Character.default_directive()
        );
        assert_eq!(
            client.endpoint("chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
    }
}
