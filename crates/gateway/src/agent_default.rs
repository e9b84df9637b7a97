//! Default `Agent` driver (§6 "Agent driver").
//!
//! The agent loop's internal LLM streaming/tool-call parsing is explicitly
//! out of scope (§1) — this is a minimal, non-tool-calling adapter against
//! an OpenAI-compatible `/v1/chat/completions` endpoint, in the same spirit
//! as [`crate::inference::HttpInferenceClient`]: it exists so the daemon is
//! runnable end-to-end without every deployment supplying its own `Agent`.
//! A deployment with a real agent loop (tool-call parsing, multi-step
//! planning, token-by-token streaming) injects its own implementation of
//! the trait instead, via `SessionManager::new`.

use std::time::Duration;

use async_trait::async_trait;
use sd_domain::agent::{Agent, AgentInput, AgentOutput, AgentStreamEvent};
use sd_domain::error::{Error, Result};
use sd_domain::tool::{Message, Role};
use serde::Deserialize;
use serde_json::json;

pub struct HttpAgent {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl Agent for HttpAgent {
    async fn run_turn(&self, model: &str, input: AgentInput<'_>) -> Result<AgentOutput> {
        let mut messages = input.existing_messages;
        messages.push(Message::user(input.user_content));

        let wire: Vec<serde_json::Value> = messages.iter().map(to_wire_message).collect();
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let request = self
            .client
            .post(&url)
            .json(&json!({ "model": model, "messages": wire }))
            .timeout(Duration::from_secs(120))
            .send();

        let response = tokio::select! {
            result = request => result.map_err(map_transport_error)?,
            _ = input.cancel.cancelled() => return Err(Error::Cancelled),
        };

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Other(format!("malformed chat completion response: {e}")))?;

        let content = parsed.choices.into_iter().next().map(|c| c.message.content).unwrap_or_default();
        input.stream.on_event(AgentStreamEvent::Token { text: content.clone() }).await;
        messages.push(Message::assistant(&content));

        let usage = parsed.usage.unwrap_or_default();
        Ok(AgentOutput {
            messages,
            tool_calls: 0,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::LmxConnectionRefused
    } else if e.is_timeout() {
        Error::LmxTimeout
    } else {
        Error::Other(format!("inference request failed: {e}"))
    }
}

fn to_wire_message(m: &Message) -> serde_json::Value {
    json!({ "role": role_str(m.role), "content": m.content.extract_all_text() })
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}
