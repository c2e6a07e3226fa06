use async_trait::async_trait;
use casebook_core::{AgentError, ErrorCode};
use serde_json::{json, Value};
use tracing::debug;

/// Client side of the tool-server envelope. Skills never talk to the
/// upstream backend directly.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn call(&self, tool: &str, params: Value) -> Result<Value, AgentError>;
}

pub struct HttpToolClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpToolClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs.clamp(1, 60)))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    async fn call(&self, tool: &str, params: Value) -> Result<Value, AgentError> {
        let url = format!("{}/mcp/tools/{tool}", self.base_url);
        debug!(event_name = "agent.tool.call", tool, "calling tool server");

        let response = self
            .http
            .post(&url)
            .json(&json!({"params": params}))
            .send()
            .await
            .map_err(|error| AgentError::ToolFailed {
                tool: tool.to_owned(),
                code: ErrorCode::ToolCallFailed,
                message: error.to_string(),
            })?;

        let body: Value = response.json().await.map_err(|error| AgentError::ToolFailed {
            tool: tool.to_owned(),
            code: ErrorCode::ToolCallFailed,
            message: format!("malformed envelope: {error}"),
        })?;

        if body.get("success").and_then(Value::as_bool) == Some(true) {
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }

        let code = body
            .pointer("/error/code")
            .cloned()
            .and_then(|code| serde_json::from_value(code).ok())
            .unwrap_or(ErrorCode::ToolCallFailed);
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("tool call failed")
            .to_owned();
        Err(AgentError::ToolFailed { tool: tool.to_owned(), code, message })
    }
}

/// Tool name constants shared by skills.
pub mod tools {
    pub const SEARCH: &str = "feishu.v1.bitable.search";
    pub const SEARCH_EXACT: &str = "feishu.v1.bitable.search_exact";
    pub const SEARCH_KEYWORD: &str = "feishu.v1.bitable.search_keyword";
    pub const SEARCH_PERSON: &str = "feishu.v1.bitable.search_person";
    pub const SEARCH_DATE_RANGE: &str = "feishu.v1.bitable.search_date_range";
    pub const RECORD_GET: &str = "feishu.v1.bitable.record.get";
    pub const RECORD_CREATE: &str = "feishu.v1.bitable.record.create";
    pub const RECORD_UPDATE: &str = "feishu.v1.bitable.record.update";
    pub const RECORD_DELETE: &str = "feishu.v1.bitable.record.delete";
}
