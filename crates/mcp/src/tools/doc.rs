use std::sync::Arc;

use async_trait::async_trait;
use casebook_core::{ErrorBody, ErrorCode};
use casebook_feishu::sender::request_error;
use casebook_feishu::TokenCache;
use serde_json::{json, Value};

use crate::registry::{ParamKind, ParamSpec, Tool};

/// Full-text document search against the docs suite API.
pub struct DocSearchTool {
    pub http: reqwest::Client,
    pub domain: String,
    pub tokens: Arc<TokenCache>,
}

#[async_trait]
impl Tool for DocSearchTool {
    fn name(&self) -> &'static str {
        "feishu.v1.doc.search"
    }

    fn description(&self) -> &'static str {
        "Search documents by keyword"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("query", ParamKind::String, "search keyword"),
            ParamSpec::optional("count", ParamKind::Integer, "max results (default 10)"),
        ]
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let query = params["query"].as_str().unwrap_or_default().trim();
        if query.is_empty() {
            return Err(ErrorBody::new(ErrorCode::ToolCallFailed, "query must be non-empty"));
        }
        let count = params.get("count").and_then(Value::as_i64).unwrap_or(10).clamp(1, 50);

        let token = self
            .tokens
            .tenant_token()
            .await
            .map_err(|error| ErrorBody::new(error.code(), error.to_string()))?;
        let url = format!(
            "{}/open-apis/suite/docs-api/search/object",
            self.domain.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({"search_key": query, "count": count}))
            .send()
            .await
            .map_err(|error| {
                let upstream = request_error(error);
                ErrorBody::new(upstream.code(), upstream.to_string())
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|error| {
            ErrorBody::new(ErrorCode::ToolCallFailed, format!("malformed doc response: {error}"))
        })?;
        if !status.is_success() {
            return Err(ErrorBody::new(
                ErrorCode::ToolCallFailed,
                format!("doc search returned {status}"),
            ));
        }

        let items: Vec<Value> = body
            .pointer("/data/docs_entities")
            .and_then(Value::as_array)
            .map(|entities| {
                entities
                    .iter()
                    .map(|entity| {
                        json!({
                            "title": entity.get("title").and_then(Value::as_str).unwrap_or_default(),
                            "url": entity.get("url").and_then(Value::as_str).unwrap_or_default(),
                            "doc_type": entity.get("docs_type").and_then(Value::as_str).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({"items": items}))
    }
}
