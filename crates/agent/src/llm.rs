use std::time::Duration;

use async_trait::async_trait;
use casebook_core::config::LlmEndpoint;
use casebook_core::AgentError;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::debug;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, AgentError>;

    /// Completion that must come back as a JSON object. Providers that wrap
    /// JSON in prose get the first `{...}` span extracted.
    async fn complete_json(&self, prompt: &str) -> Result<Value, AgentError> {
        let raw = self.complete(prompt).await?;
        extract_json_object(&raw)
            .ok_or_else(|| AgentError::LlmFailed(format!("no JSON object in response: {raw}")))
    }
}

/// Chat-completions HTTP client. One instance per routed model; the
/// orchestrator holds a task-model client and a chat-model client.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpLlmClient {
    pub fn from_endpoint(endpoint: &LlmEndpoint) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(endpoint.timeout_secs.clamp(1, 300)))
                .build()
                .unwrap_or_default(),
            base_url: endpoint.base_url.trim_end_matches('/').to_owned(),
            model: endpoint.model.clone(),
            api_key: endpoint.api_key.as_ref().map(|key| key.expose_secret().to_owned()),
            timeout_secs: endpoint.timeout_secs,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, AgentError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.http.post(&url).json(&json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                AgentError::LlmTimeout { timeout_secs: self.timeout_secs }
            } else {
                AgentError::LlmFailed(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::LlmFailed(format!("provider returned {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|error| AgentError::LlmFailed(format!("malformed response: {error}")))?;

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::LlmFailed("response missing message content".into()))?;
        debug!(event_name = "agent.llm.completed", model = %self.model, "llm call finished");
        Ok(content.to_owned())
    }
}

/// Pulls the first balanced `{...}` object out of a completion.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &raw[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::extract_json_object;

    #[test]
    fn extracts_object_from_prose_wrapping() {
        let raw = "Sure, here is the result:\n```json\n{\"skills\": [{\"name\": \"QuerySkill\", \"score\": 0.9}]}\n``` hope it helps";
        let value = extract_json_object(raw).expect("object");
        assert_eq!(value["skills"][0]["name"], "QuerySkill");
    }

    #[test]
    fn nested_braces_and_strings_are_balanced() {
        let raw = r#"{"a": {"b": "close } brace in string"}, "c": 1}"#;
        let value = extract_json_object(raw).expect("object");
        assert_eq!(value["c"], 1);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{broken").is_none());
    }
}
