use std::sync::Arc;

use async_trait::async_trait;
use casebook_core::{
    AppToken, FieldDescriptor, FieldMap, FieldValue, RecordId, TableId, TableSchema, UpstreamError,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::sender::{request_error, TokenCache};

/// One table of a bitable app.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    pub table_id: TableId,
    pub name: String,
}

/// One fetched record with its upstream modification stamp.
#[derive(Clone, Debug, PartialEq)]
pub struct BitableRecord {
    pub record_id: RecordId,
    pub fields: FieldMap,
    pub last_modified_ms: i64,
}

/// One page of a record listing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordPage {
    pub items: Vec<BitableRecord>,
    pub has_more: bool,
    pub page_token: Option<String>,
}

/// Server-side search filters the tool layer exposes.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchFilter {
    Exact { field: String, value: String },
    Keyword { field: String, keyword: String },
    Person { field: String, open_id: String },
    DateRange { field: String, from_ms: i64, to_ms: i64 },
}

impl SearchFilter {
    fn to_payload(&self) -> Value {
        match self {
            Self::Exact { field, value } => json!({
                "conjunction": "and",
                "conditions": [
                    {"field_name": field, "operator": "is", "value": [value]}
                ]
            }),
            Self::Keyword { field, keyword } => json!({
                "conjunction": "and",
                "conditions": [
                    {"field_name": field, "operator": "contains", "value": [keyword]}
                ]
            }),
            Self::Person { field, open_id } => json!({
                "conjunction": "and",
                "conditions": [
                    {"field_name": field, "operator": "is", "value": [open_id]}
                ]
            }),
            Self::DateRange { field, from_ms, to_ms } => json!({
                "conjunction": "and",
                "conditions": [
                    {
                        "field_name": field,
                        "operator": "isGreater",
                        "value": ["ExactDate", (from_ms - 1).to_string()]
                    },
                    {
                        "field_name": field,
                        "operator": "isLess",
                        "value": ["ExactDate", (to_ms + 1).to_string()]
                    }
                ]
            }),
        }
    }
}

/// Input for `calendar.create` actions.
#[derive(Clone, Debug, PartialEq)]
pub struct CalendarEventInput {
    pub title: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

#[async_trait]
pub trait BitableApi: Send + Sync {
    async fn list_tables(&self, app_token: &AppToken) -> Result<Vec<TableInfo>, UpstreamError>;

    async fn list_fields(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Result<TableSchema, UpstreamError>;

    async fn get_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        field_names: Option<&[String]>,
    ) -> Result<Option<FieldMap>, UpstreamError>;

    async fn create_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        fields: &FieldMap,
    ) -> Result<RecordId, UpstreamError>;

    async fn update_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> Result<(), UpstreamError>;

    async fn delete_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
    ) -> Result<bool, UpstreamError>;

    async fn search_records(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        filter: Option<&SearchFilter>,
        page_token: Option<&str>,
        page_size: u32,
        field_names: Option<&[String]>,
    ) -> Result<RecordPage, UpstreamError>;

    async fn create_calendar_event(
        &self,
        input: &CalendarEventInput,
    ) -> Result<String, UpstreamError>;
}

/// HTTP client for the bitable and calendar REST APIs.
pub struct BitableClient {
    http: reqwest::Client,
    domain: String,
    tokens: Arc<TokenCache>,
}

impl BitableClient {
    pub fn new(http: reqwest::Client, domain: &str, tokens: Arc<TokenCache>) -> Self {
        Self { http, domain: domain.trim_end_matches('/').to_owned(), tokens }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let token = self.tokens.tenant_token().await?;
        let url = format!("{}{path}", self.domain);
        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|error| UpstreamError::Malformed(error.to_string()))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            self.tokens.invalidate().await;
            return Err(UpstreamError::Auth(upstream_message(&body)));
        }
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message: upstream_message(&body),
            });
        }
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            // Record-not-found comes back as a business code on HTTP 200.
            let message = upstream_message(&body);
            let status = if code == 1_254_043 || code == 1_254_005 { 404 } else { 502 };
            return Err(UpstreamError::Status { status, message });
        }
        Ok(body)
    }

    fn encode_fields(fields: &FieldMap) -> Value {
        let mut map = Map::new();
        for (name, value) in fields {
            map.insert(name.clone(), value.to_raw());
        }
        Value::Object(map)
    }

    fn decode_fields(raw: &Value) -> FieldMap {
        let mut fields = FieldMap::new();
        if let Some(object) = raw.as_object() {
            for (name, value) in object {
                fields.insert(name.clone(), FieldValue::from_raw(value));
            }
        }
        fields
    }

    fn decode_record(item: &Value) -> Option<BitableRecord> {
        let record_id = item
            .get("record_id")
            .or_else(|| item.get("id"))
            .and_then(Value::as_str)?
            .to_owned();
        let fields = item.get("fields").map(Self::decode_fields).unwrap_or_default();
        let last_modified_ms = item
            .get("last_modified_time")
            .or_else(|| item.get("modified_time"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Some(BitableRecord { record_id: RecordId(record_id), fields, last_modified_ms })
    }
}

fn upstream_message(body: &Value) -> String {
    body.get("msg")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("upstream request failed")
        .to_owned()
}

#[async_trait]
impl BitableApi for BitableClient {
    async fn list_tables(&self, app_token: &AppToken) -> Result<Vec<TableInfo>, UpstreamError> {
        let path = format!("/open-apis/bitable/v1/apps/{}/tables?page_size=100", app_token.0);
        let body = self.request(reqwest::Method::GET, &path, None).await?;
        let items = body
            .pointer("/data/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|item| {
                let table_id = item.get("table_id").and_then(Value::as_str)?;
                let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
                Some(TableInfo { table_id: TableId(table_id.to_owned()), name: name.to_owned() })
            })
            .collect())
    }

    async fn list_fields(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
    ) -> Result<TableSchema, UpstreamError> {
        let path = format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/fields?page_size=200",
            app_token.0, table_id.0
        );
        let body = self.request(reqwest::Method::GET, &path, None).await?;
        let items = body
            .pointer("/data/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let fields = items
            .iter()
            .filter_map(|item| {
                Some(FieldDescriptor {
                    field_id: item.get("field_id").and_then(Value::as_str)?.to_owned(),
                    name: item.get("field_name").and_then(Value::as_str)?.to_owned(),
                    field_type: item.get("type").and_then(Value::as_i64).unwrap_or(0),
                })
            })
            .collect();
        Ok(TableSchema::from_fields(fields))
    }

    async fn get_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        field_names: Option<&[String]>,
    ) -> Result<Option<FieldMap>, UpstreamError> {
        let mut path = format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/records/{}",
            app_token.0, table_id.0, record_id.0
        );
        if let Some(names) = field_names {
            if !names.is_empty() {
                let encoded = serde_json::to_string(names).unwrap_or_default();
                path.push_str(&format!("?field_names={encoded}"));
            }
        }

        match self.request(reqwest::Method::GET, &path, None).await {
            Ok(body) => {
                let fields = body
                    .pointer("/data/record/fields")
                    .or_else(|| body.pointer("/data/fields"))
                    .map(Self::decode_fields)
                    .unwrap_or_default();
                Ok(Some(fields))
            }
            Err(UpstreamError::Status { status: 404, .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn create_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        fields: &FieldMap,
    ) -> Result<RecordId, UpstreamError> {
        let path = format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/records",
            app_token.0, table_id.0
        );
        let body = self
            .request(
                reqwest::Method::POST,
                &path,
                Some(&json!({"fields": Self::encode_fields(fields)})),
            )
            .await?;

        body.pointer("/data/record/record_id")
            .and_then(Value::as_str)
            .map(|id| RecordId(id.to_owned()))
            .ok_or_else(|| UpstreamError::Malformed("create response missing record_id".into()))
    }

    async fn update_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> Result<(), UpstreamError> {
        let path = format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/records/{}",
            app_token.0, table_id.0, record_id.0
        );
        self.request(
            reqwest::Method::PUT,
            &path,
            Some(&json!({"fields": Self::encode_fields(fields)})),
        )
        .await?;
        Ok(())
    }

    async fn delete_record(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        record_id: &RecordId,
    ) -> Result<bool, UpstreamError> {
        let path = format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/records/{}",
            app_token.0, table_id.0, record_id.0
        );
        match self.request(reqwest::Method::DELETE, &path, None).await {
            Ok(_) => Ok(true),
            Err(UpstreamError::Status { status: 404, .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn search_records(
        &self,
        app_token: &AppToken,
        table_id: &TableId,
        filter: Option<&SearchFilter>,
        page_token: Option<&str>,
        page_size: u32,
        field_names: Option<&[String]>,
    ) -> Result<RecordPage, UpstreamError> {
        let mut path = format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/records/search?page_size={}",
            app_token.0,
            table_id.0,
            page_size.clamp(1, 500)
        );
        if let Some(token) = page_token {
            if !token.is_empty() {
                path.push_str(&format!("&page_token={token}"));
            }
        }

        let mut payload = Map::new();
        if let Some(filter) = filter {
            payload.insert("filter".to_owned(), filter.to_payload());
        }
        if let Some(names) = field_names {
            if !names.is_empty() {
                payload.insert(
                    "field_names".to_owned(),
                    Value::Array(names.iter().cloned().map(Value::String).collect()),
                );
            }
        }

        let body = self
            .request(reqwest::Method::POST, &path, Some(&Value::Object(payload)))
            .await?;
        let data = body.get("data").cloned().unwrap_or_default();

        let items = data
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Self::decode_record).collect())
            .unwrap_or_default();

        debug!(
            event_name = "feishu.bitable.search",
            table_id = %table_id.0,
            page_size,
            "search page fetched"
        );

        Ok(RecordPage {
            items,
            has_more: data.get("has_more").and_then(Value::as_bool).unwrap_or(false),
            page_token: data
                .get("page_token")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_owned),
        })
    }

    async fn create_calendar_event(
        &self,
        input: &CalendarEventInput,
    ) -> Result<String, UpstreamError> {
        let path = "/open-apis/calendar/v4/calendars/primary/events".to_owned();
        let body = self
            .request(
                reqwest::Method::POST,
                &path,
                Some(&json!({
                    "summary": input.title,
                    "start_time": {"timestamp": (input.start_ms / 1000).to_string()},
                    "end_time": {"timestamp": (input.end_ms / 1000).to_string()},
                })),
            )
            .await?;

        body.pointer("/data/event/event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| UpstreamError::Malformed("calendar response missing event_id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::SearchFilter;

    #[test]
    fn filters_serialize_to_upstream_condition_payloads() {
        let exact = SearchFilter::Exact { field: "案号".into(), value: "(2026)沪01民终1号".into() }
            .to_payload();
        assert_eq!(exact["conditions"][0]["operator"], "is");

        let person =
            SearchFilter::Person { field: "主办律师".into(), open_id: "ou_A".into() }.to_payload();
        assert_eq!(person["conditions"][0]["value"][0], "ou_A");

        let range = SearchFilter::DateRange {
            field: "开庭日".into(),
            from_ms: 1_000,
            to_ms: 2_000,
        }
        .to_payload();
        assert_eq!(range["conditions"][0]["operator"], "isGreater");
        assert_eq!(range["conditions"][1]["operator"], "isLess");
        assert_eq!(range["conditions"][0]["value"][1], "999");
        assert_eq!(range["conditions"][1]["value"][1], "2001");
    }
}
