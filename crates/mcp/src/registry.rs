use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use casebook_core::{ErrorBody, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Declared parameter type for validation and the published tool schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self { name, kind, required: true, description }
    }

    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self { name, kind, required: false, description }
    }
}

/// A named, schema-validated RPC exposed by the tool server.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn params(&self) -> Vec<ParamSpec>;
    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody>;
}

/// Wire envelope of the tool surface. Kept bit-exact: `data` and `error` are
/// always present, one of them null.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorBody>,
}

impl ToolEnvelope {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn err(error: ErrorBody) -> Self {
        Self { success: false, data: None, error: Some(error) }
    }
}

/// Maps tool names to parameter-validated invocations.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name(), Arc::new(tool));
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Published listing: name, description, and parameter schema per tool.
    pub fn describe(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "params": tool.params(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    pub async fn dispatch(&self, tool_name: &str, params: Value) -> ToolEnvelope {
        let Some(tool) = self.tools.get(tool_name) else {
            warn!(event_name = "mcp.tool.unknown", tool = tool_name, "unknown tool requested");
            return ToolEnvelope::err(ErrorBody::new(
                ErrorCode::NotFound,
                format!("unknown tool `{tool_name}`"),
            ));
        };

        if let Err(error) = validate_params(&tool.params(), &params) {
            return ToolEnvelope::err(error);
        }

        debug!(event_name = "mcp.tool.invoke", tool = tool_name, "dispatching tool call");
        match tool.invoke(params).await {
            Ok(data) => ToolEnvelope::ok(data),
            Err(error) => {
                warn!(
                    event_name = "mcp.tool.failed",
                    tool = tool_name,
                    code = %error.code,
                    message = %error.message,
                    "tool call failed"
                );
                ToolEnvelope::err(error)
            }
        }
    }
}

fn validate_params(specs: &[ParamSpec], params: &Value) -> Result<(), ErrorBody> {
    let Some(object) = params.as_object() else {
        return Err(ErrorBody::new(ErrorCode::ToolCallFailed, "params must be an object"));
    };

    for spec in specs {
        match object.get(spec.name) {
            None | Some(Value::Null) if spec.required => {
                return Err(ErrorBody::new(
                    ErrorCode::ToolCallFailed,
                    format!("missing required param `{}`", spec.name),
                )
                .with_detail(json!({"param": spec.name})));
            }
            Some(value) if !value.is_null() && !spec.kind.accepts(value) => {
                return Err(ErrorBody::new(
                    ErrorCode::ToolCallFailed,
                    format!("param `{}` has the wrong type", spec.name),
                )
                .with_detail(json!({"param": spec.name, "expected": spec.kind})));
            }
            _ => {}
        }
    }

    let known: Vec<&str> = specs.iter().map(|spec| spec.name).collect();
    for name in object.keys() {
        if !known.contains(&name.as_str()) {
            return Err(ErrorBody::new(
                ErrorCode::ToolCallFailed,
                format!("unknown param `{name}`"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use casebook_core::{ErrorBody, ErrorCode};
    use serde_json::{json, Value};

    use super::{ParamKind, ParamSpec, Tool, ToolRegistry};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "test.echo"
        }

        fn description(&self) -> &'static str {
            "echoes the text param"
        }

        fn params(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::required("text", ParamKind::String, "text to echo"),
                ParamSpec::optional("repeat", ParamKind::Integer, "repeat count"),
            ]
        }

        async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
            let text = params["text"].as_str().unwrap_or_default();
            let repeat = params.get("repeat").and_then(Value::as_i64).unwrap_or(1);
            Ok(json!({"echo": text.repeat(repeat.max(0) as usize)}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry
    }

    #[tokio::test]
    async fn valid_call_returns_success_envelope() {
        let envelope = registry().dispatch("test.echo", json!({"text": "hi", "repeat": 2})).await;
        assert!(envelope.success);
        assert_eq!(envelope.data.expect("data")["echo"], "hihi");
        assert!(envelope.error.is_none());
    }

    #[tokio::test]
    async fn unknown_tool_maps_to_not_found() {
        let envelope = registry().dispatch("test.missing", json!({})).await;
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.error.expect("error").code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn missing_required_param_is_rejected_before_invoke() {
        let envelope = registry().dispatch("test.echo", json!({"repeat": 2})).await;
        let error = envelope.error.expect("error");
        assert_eq!(error.code, ErrorCode::ToolCallFailed);
        assert!(error.message.contains("text"));
    }

    #[tokio::test]
    async fn wrong_type_and_unknown_params_are_rejected() {
        let wrong_type = registry().dispatch("test.echo", json!({"text": 5})).await;
        assert!(!wrong_type.success);

        let unknown = registry().dispatch("test.echo", json!({"text": "x", "bogus": 1})).await;
        assert!(unknown.error.expect("error").message.contains("bogus"));
    }

    #[test]
    fn describe_lists_schemas() {
        let listing = registry().describe();
        let tools = listing["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "test.echo");
        assert_eq!(tools[0]["params"][0]["name"], "text");
    }
}
