use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable error codes carried on the wire and in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Upstream tool call failed.
    #[serde(rename = "MCP_001")]
    ToolCallFailed,
    /// Requested resource not found.
    #[serde(rename = "MCP_002")]
    NotFound,
    /// Authorization / permission denied.
    #[serde(rename = "MCP_003")]
    PermissionDenied,
    /// LLM call timed out.
    #[serde(rename = "AGENT_001")]
    LlmTimeout,
    /// Tool execution failed inside a skill.
    #[serde(rename = "AGENT_002")]
    SkillToolFailed,
    /// Signature verification failed.
    #[serde(rename = "WEBHOOK_001")]
    SignatureInvalid,
    /// Referenced field no longer exists.
    #[serde(rename = "SCHEMA_001")]
    FieldMissing,
    /// Action pipeline exhausted retries.
    #[serde(rename = "AUTOMATION_001")]
    PipelineExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCallFailed => "MCP_001",
            Self::NotFound => "MCP_002",
            Self::PermissionDenied => "MCP_003",
            Self::LlmTimeout => "AGENT_001",
            Self::SkillToolFailed => "AGENT_002",
            Self::SignatureInvalid => "WEBHOOK_001",
            Self::FieldMissing => "SCHEMA_001",
            Self::PipelineExhausted => "AUTOMATION_001",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of an error inside the tool-server envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), detail: None }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Failure of an upstream call, classified for retry policy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream timeout: {0}")]
    Timeout(String),
    #[error("upstream network failure: {0}")]
    Network(String),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("upstream auth failure: {0}")]
    Auth(String),
    #[error("upstream response malformed: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// Transient categories (network, 5xx, 429) are retried; auth and other
    /// 4xx are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Auth(_) | Self::Malformed(_) => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::PermissionDenied,
            Self::Status { status: 404, .. } => ErrorCode::NotFound,
            _ => ErrorCode::ToolCallFailed,
        }
    }
}

/// Errors surfaced by the automation engine. Never propagated to event
/// callers beyond a 200 + run-log/dead-letter entry.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation is disabled")]
    Disabled,
    #[error("invalid automation payload: {0}")]
    Validation(String),
    #[error("webhook authentication failed: {0}")]
    AuthFailed(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("store failure: {0}")]
    Store(String),
    #[error("action pipeline exhausted retries: {0}")]
    PipelineExhausted(String),
}

impl AutomationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailed(_) => ErrorCode::SignatureInvalid,
            Self::Upstream(upstream) => upstream.code(),
            Self::PipelineExhausted(_) => ErrorCode::PipelineExhausted,
            _ => ErrorCode::ToolCallFailed,
        }
    }
}

/// Errors surfaced inside the conversation pipeline. Skills convert these to
/// friendly text; the orchestrator never leaks internals.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("llm call timed out after {timeout_secs}s")]
    LlmTimeout { timeout_secs: u64 },
    #[error("llm call failed: {0}")]
    LlmFailed(String),
    #[error("tool `{tool}` failed: {message}")]
    ToolFailed { tool: String, code: ErrorCode, message: String },
    #[error("conversation state unavailable: {0}")]
    State(String),
    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
}

impl AgentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LlmTimeout { .. } => ErrorCode::LlmTimeout,
            Self::ToolFailed { code, .. } => *code,
            _ => ErrorCode::SkillToolFailed,
        }
    }

    /// User-safe message; internal detail stays in logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::LlmTimeout { .. } => "我这边响应有点慢，请稍后再试一次。",
            Self::LlmFailed(_) => "我暂时没能理解这条消息，请换个说法试试。",
            Self::ToolFailed { .. } => "操作没有成功，请稍后重试或换个说法。",
            Self::State(_) => "会话状态暂时不可用，请稍后重试。",
            Self::MissingCollaborator(_) => "服务初始化不完整，请联系管理员。",
        }
    }
}
