//! HTTP-level tests of the tool surface: envelope shape, tool listing,
//! validation, and the create → update → delete → get round trip against an
//! in-memory upstream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use casebook_core::{AppToken, FieldMap, RecordId, TableId, TableSchema, UpstreamError};
use casebook_feishu::{
    BitableApi, BitableRecord, CalendarEventInput, RecordPage, SearchFilter, TableInfo,
};
use casebook_mcp::tools::{
    BitableToolContext, ListTablesTool, RecordCreateTool, RecordDeleteTool, RecordGetTool,
    RecordUpdateTool, SearchMode, SearchTool,
};
use casebook_mcp::ToolRegistry;
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryBitable {
    records: Mutex<HashMap<String, FieldMap>>,
}

#[async_trait]
impl BitableApi for MemoryBitable {
    async fn list_tables(&self, _app: &AppToken) -> Result<Vec<TableInfo>, UpstreamError> {
        Ok(vec![TableInfo { table_id: TableId("tblCases".into()), name: "案件".into() }])
    }

    async fn list_fields(
        &self,
        _app: &AppToken,
        _table: &TableId,
    ) -> Result<TableSchema, UpstreamError> {
        Ok(TableSchema::default())
    }

    async fn get_record(
        &self,
        _app: &AppToken,
        _table: &TableId,
        record_id: &RecordId,
        _field_names: Option<&[String]>,
    ) -> Result<Option<FieldMap>, UpstreamError> {
        Ok(self.records.lock().await.get(&record_id.0).cloned())
    }

    async fn create_record(
        &self,
        _app: &AppToken,
        _table: &TableId,
        fields: &FieldMap,
    ) -> Result<RecordId, UpstreamError> {
        let mut records = self.records.lock().await;
        let record_id = format!("rec{:04}", records.len() + 1);
        records.insert(record_id.clone(), fields.clone());
        Ok(RecordId(record_id))
    }

    async fn update_record(
        &self,
        _app: &AppToken,
        _table: &TableId,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> Result<(), UpstreamError> {
        let mut records = self.records.lock().await;
        let existing = records.get_mut(&record_id.0).ok_or(UpstreamError::Status {
            status: 404,
            message: "record not found".into(),
        })?;
        for (name, value) in fields {
            existing.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete_record(
        &self,
        _app: &AppToken,
        _table: &TableId,
        record_id: &RecordId,
    ) -> Result<bool, UpstreamError> {
        Ok(self.records.lock().await.remove(&record_id.0).is_some())
    }

    async fn search_records(
        &self,
        _app: &AppToken,
        _table: &TableId,
        _filter: Option<&SearchFilter>,
        _page_token: Option<&str>,
        _page_size: u32,
        _field_names: Option<&[String]>,
    ) -> Result<RecordPage, UpstreamError> {
        let records = self.records.lock().await;
        Ok(RecordPage {
            items: records
                .iter()
                .map(|(record_id, fields)| BitableRecord {
                    record_id: RecordId(record_id.clone()),
                    fields: fields.clone(),
                    last_modified_ms: 0,
                })
                .collect(),
            has_more: false,
            page_token: None,
        })
    }

    async fn create_calendar_event(
        &self,
        _input: &CalendarEventInput,
    ) -> Result<String, UpstreamError> {
        Ok("evt_cal_1".into())
    }
}

async fn spawn_server() -> String {
    let context = Arc::new(BitableToolContext {
        api: Arc::new(MemoryBitable::default()),
        default_app_token: "appA".into(),
        default_table_id: "tblCases".into(),
    });
    let mut registry = ToolRegistry::new();
    registry.register(ListTablesTool { context: context.clone() });
    for mode in [
        SearchMode::Plain,
        SearchMode::Exact,
        SearchMode::Keyword,
        SearchMode::Person,
        SearchMode::DateRange,
    ] {
        registry.register(SearchTool { context: context.clone(), mode });
    }
    registry.register(RecordGetTool { context: context.clone() });
    registry.register(RecordCreateTool { context: context.clone() });
    registry.register(RecordUpdateTool { context: context.clone() });
    registry.register(RecordDeleteTool { context });

    let router = casebook_mcp::router(Arc::new(registry));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{address}")
}

async fn call_tool(base: &str, tool: &str, params: Value) -> Value {
    let client = reqwest::Client::new();
    client
        .post(format!("{base}/mcp/tools/{tool}"))
        .json(&json!({"params": params}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json body")
}

#[tokio::test]
async fn health_and_listing_respond() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(health, json!({"status": "ok"}));

    let listing: Value = client
        .get(format!("{base}/mcp/tools"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let tools = listing["tools"].as_array().expect("tools");
    assert_eq!(tools.len(), 10);
    assert!(tools.iter().any(|tool| tool["name"] == "feishu.v1.bitable.record.create"));
}

#[tokio::test]
async fn crud_round_trip_over_http() {
    let base = spawn_server().await;

    // create → get returns the created fields
    let created = call_tool(
        &base,
        "feishu.v1.bitable.record.create",
        json!({"fields": {"案号": "(2026)沪01民终1号", "委托人": "张三"}}),
    )
    .await;
    assert_eq!(created["success"], true);
    assert_eq!(created["error"], Value::Null);
    let record_id = created["data"]["record_id"].as_str().expect("record id").to_owned();

    let fetched =
        call_tool(&base, "feishu.v1.bitable.record.get", json!({"record_id": record_id})).await;
    assert_eq!(fetched["data"]["fields"]["案号"], "(2026)沪01民终1号");

    // create → update(x=v) → get returns x=v
    call_tool(
        &base,
        "feishu.v1.bitable.record.update",
        json!({"record_id": record_id, "fields": {"案由": "合同纠纷"}}),
    )
    .await;
    let fetched =
        call_tool(&base, "feishu.v1.bitable.record.get", json!({"record_id": record_id})).await;
    assert_eq!(fetched["data"]["fields"]["案由"], "合同纠纷");

    // create → delete → get fails with MCP_002
    let deleted =
        call_tool(&base, "feishu.v1.bitable.record.delete", json!({"record_id": record_id}))
            .await;
    assert_eq!(deleted["success"], true);

    let missing =
        call_tool(&base, "feishu.v1.bitable.record.get", json!({"record_id": record_id})).await;
    assert_eq!(missing["success"], false);
    assert_eq!(missing["data"], Value::Null);
    assert_eq!(missing["error"]["code"], "MCP_002");
}

#[tokio::test]
async fn unknown_tool_and_invalid_params_map_to_error_envelopes() {
    let base = spawn_server().await;

    let unknown = call_tool(&base, "feishu.v1.bitable.record.explode", json!({})).await;
    assert_eq!(unknown["success"], false);
    assert_eq!(unknown["error"]["code"], "MCP_002");

    let invalid = call_tool(&base, "feishu.v1.bitable.record.get", json!({})).await;
    assert_eq!(invalid["success"], false);
    assert_eq!(invalid["error"]["code"], "MCP_001");
    assert!(invalid["error"]["message"].as_str().expect("message").contains("record_id"));
}

#[tokio::test]
async fn raw_field_values_round_trip_through_the_typed_layer() {
    let base = spawn_server().await;
    let created = call_tool(
        &base,
        "feishu.v1.bitable.record.create",
        json!({"fields": {
            "案号": "A-1",
            "开庭日": 1_770_393_600_000_i64,
            "标的额": 12.5,
            "标签": ["加急", "重点"],
        }}),
    )
    .await;
    let record_id = created["data"]["record_id"].as_str().expect("record id").to_owned();

    let fetched =
        call_tool(&base, "feishu.v1.bitable.record.get", json!({"record_id": record_id})).await;
    let fields = &fetched["data"]["fields"];
    assert_eq!(fields["开庭日"], 1_770_393_600_000_i64);
    assert_eq!(fields["标的额"], 12.5);
    assert_eq!(fields["标签"], json!(["加急", "重点"]));
}
