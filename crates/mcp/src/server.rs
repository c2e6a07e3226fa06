use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::registry::{ToolEnvelope, ToolRegistry};

#[derive(Clone)]
pub struct ToolServerState {
    pub registry: Arc<ToolRegistry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolCallBody {
    #[serde(default)]
    pub params: Value,
}

pub fn router(registry: Arc<ToolRegistry>) -> Router {
    Router::new()
        .route("/mcp/tools/:tool_name", post(call_tool))
        .route("/mcp/tools", get(list_tools))
        .route("/health", get(health))
        .with_state(ToolServerState { registry })
}

pub async fn serve(
    bind_address: &str,
    port: u16,
    registry: Arc<ToolRegistry>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        event_name = "mcp.server.started",
        bind_address = %address,
        tools = registry.tool_count(),
        "tool server listening"
    );
    axum::serve(listener, router(registry))
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))
}

async fn call_tool(
    State(state): State<ToolServerState>,
    Path(tool_name): Path<String>,
    Json(body): Json<ToolCallBody>,
) -> Json<ToolEnvelope> {
    let params = if body.params.is_null() { json!({}) } else { body.params };
    Json(state.registry.dispatch(&tool_name, params).await)
}

async fn list_tools(State(state): State<ToolServerState>) -> Json<Value> {
    Json(state.registry.describe())
}

async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::extract::{Path, State};
    use axum::Json;
    use casebook_core::ErrorBody;
    use serde_json::{json, Value};

    use crate::registry::{ParamKind, ParamSpec, Tool, ToolRegistry};

    use super::{call_tool, health, list_tools, ToolCallBody, ToolServerState};

    struct PingTool;

    #[async_trait]
    impl Tool for PingTool {
        fn name(&self) -> &'static str {
            "test.ping"
        }

        fn description(&self) -> &'static str {
            "replies pong"
        }

        fn params(&self) -> Vec<ParamSpec> {
            vec![ParamSpec::optional("tag", ParamKind::String, "echo tag")]
        }

        async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
            Ok(json!({"pong": params.get("tag").cloned().unwrap_or(Value::Null)}))
        }
    }

    fn state() -> ToolServerState {
        let mut registry = ToolRegistry::new();
        registry.register(PingTool);
        ToolServerState { registry: Arc::new(registry) }
    }

    #[tokio::test]
    async fn call_envelope_is_bit_exact() {
        let Json(envelope) = call_tool(
            State(state()),
            Path("test.ping".to_owned()),
            Json(ToolCallBody { params: json!({"tag": "t"}) }),
        )
        .await;

        let wire = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(wire["success"], true);
        assert_eq!(wire["data"]["pong"], "t");
        assert_eq!(wire["error"], Value::Null);
    }

    #[tokio::test]
    async fn error_envelope_carries_code_and_null_data() {
        let Json(envelope) = call_tool(
            State(state()),
            Path("nope".to_owned()),
            Json(ToolCallBody { params: json!({}) }),
        )
        .await;

        let wire = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(wire["success"], false);
        assert_eq!(wire["data"], Value::Null);
        assert_eq!(wire["error"]["code"], "MCP_002");
    }

    #[tokio::test]
    async fn listing_and_health_respond() {
        let Json(listing) = list_tools(State(state())).await;
        assert_eq!(listing["tools"][0]["name"], "test.ping");

        let (status, Json(body)) = health().await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_params_field_defaults_to_empty_object() {
        let Json(envelope) = call_tool(
            State(state()),
            Path("test.ping".to_owned()),
            Json(ToolCallBody { params: Value::Null }),
        )
        .await;
        assert!(envelope.success);
    }
}
