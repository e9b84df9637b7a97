//! The injected agent driver and inference-server adapter boundary (§6).
//!
//! Both the agent loop's internal streaming/tool-call parsing and the exact
//! wire protocol of the external inference server are out of scope (§1) —
//! the daemon only depends on these trait boundaries, grounded in the
//! provider-adapter trait the teacher repo already uses for its LLM layer.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::PermissionDecision;
use crate::tool::Message;

/// One streaming callback from the agent loop (§4.6). Every callback emits
/// exactly one corresponding event through the session manager; `Token` and
/// `Reasoning` are fan-out only (ephemeral), everything else is persisted.
#[derive(Debug, Clone)]
pub enum AgentStreamEvent {
    Token { text: String },
    Reasoning { text: String },
    ToolStart { call_id: String, tool_name: String, arguments: serde_json::Value },
    ToolEnd { call_id: String, tool_name: String, result: String, is_error: bool },
    Usage { prompt_tokens: u64, completion_tokens: u64 },
}

/// Receives streaming callbacks from the agent loop and forwards them to the
/// session manager for sequencing, persistence, and fan-out.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_event(&self, event: AgentStreamEvent);
}

/// Executes one tool call on behalf of the agent loop, cooperatively
/// respecting `cancel` (§4.4, §5).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn run_tool(
        &self,
        name: &str,
        args_json: serde_json::Value,
        cancel: &crate::cancel::CancelToken,
    ) -> Result<String>;
}

/// Raises a permission request and awaits the winning decision (§4.3, §4.6).
#[async_trait]
pub trait PermissionRequester: Send + Sync {
    async fn request_permission(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<PermissionDecision>;
}

/// Input handed to the injected agent for one turn.
pub struct AgentInput<'a> {
    pub user_content: &'a str,
    pub existing_messages: Vec<Message>,
    pub cancel: crate::cancel::CancelToken,
    pub tool_executor: &'a dyn ToolExecutor,
    pub permissions: &'a dyn PermissionRequester,
    pub stream: &'a dyn StreamSink,
}

/// Output of one agent turn: the updated message history and how many tool
/// calls were made (rolled into `turn.done.payload.stats.toolCalls`).
pub struct AgentOutput {
    pub messages: Vec<Message>,
    pub tool_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// The injected agent driver (§6 "Agent driver").
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run_turn(&self, model: &str, input: AgentInput<'_>) -> Result<AgentOutput>;
}

/// The external inference server adapter boundary (§6 "External inference
/// server"): "list loaded models" (fast) and "stream a chat completion"
/// (long-lived, cancellable). The exact wire protocol is injected.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// List currently loaded model identifiers. Used by model preflight
    /// (§4.6) with a short TTL cache.
    async fn list_loaded_models(&self) -> Result<Vec<String>>;
}
