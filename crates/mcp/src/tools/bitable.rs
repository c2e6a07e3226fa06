use std::sync::Arc;

use async_trait::async_trait;
use casebook_core::{AppToken, ErrorBody, ErrorCode, FieldMap, FieldValue, RecordId, TableId, UpstreamError};
use casebook_feishu::{BitableApi, BitableRecord, SearchFilter};
use serde_json::{json, Map, Value};

use crate::registry::{ParamKind, ParamSpec, Tool};

/// Shared collaborators and defaults for every bitable tool.
pub struct BitableToolContext {
    pub api: Arc<dyn BitableApi>,
    pub default_app_token: String,
    pub default_table_id: String,
}

impl BitableToolContext {
    fn resolve_app_token(&self, params: &Value) -> Result<AppToken, ErrorBody> {
        let token = params
            .get("app_token")
            .and_then(Value::as_str)
            .filter(|token| !token.trim().is_empty())
            .unwrap_or(&self.default_app_token);
        if token.trim().is_empty() {
            return Err(ErrorBody::new(
                ErrorCode::ToolCallFailed,
                "app_token is required (no default configured)",
            ));
        }
        Ok(AppToken(token.to_owned()))
    }

    fn resolve_table_id(&self, params: &Value) -> Result<TableId, ErrorBody> {
        let table = params
            .get("table_id")
            .and_then(Value::as_str)
            .filter(|table| !table.trim().is_empty())
            .unwrap_or(&self.default_table_id);
        if table.trim().is_empty() {
            return Err(ErrorBody::new(
                ErrorCode::ToolCallFailed,
                "table_id is required (no default configured)",
            ));
        }
        Ok(TableId(table.to_owned()))
    }
}

fn upstream_error(error: UpstreamError) -> ErrorBody {
    ErrorBody::new(error.code(), error.to_string())
}

fn required_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ErrorBody> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ErrorBody::new(ErrorCode::ToolCallFailed, format!("param `{name}` must be non-empty"))
        })
}

fn decode_field_map(params: &Value) -> Result<FieldMap, ErrorBody> {
    let raw = params
        .get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| ErrorBody::new(ErrorCode::ToolCallFailed, "fields must be an object"))?;
    if raw.is_empty() {
        return Err(ErrorBody::new(ErrorCode::ToolCallFailed, "fields must not be empty"));
    }

    let mut fields = FieldMap::new();
    for (name, value) in raw {
        fields.insert(name.clone(), FieldValue::from_raw(value));
    }
    Ok(fields)
}

fn encode_fields(fields: &FieldMap) -> Value {
    let mut object = Map::new();
    for (name, value) in fields {
        object.insert(name.clone(), value.to_raw());
    }
    Value::Object(object)
}

fn encode_record(record: &BitableRecord) -> Value {
    json!({
        "record_id": record.record_id.0,
        "fields": encode_fields(&record.fields),
    })
}

fn locator_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::optional("app_token", ParamKind::String, "bitable app token (defaults from config)"),
        ParamSpec::optional("table_id", ParamKind::String, "table id (defaults from config)"),
        ParamSpec::required("record_id", ParamKind::String, "target record id"),
    ]
}

// ---------------------------------------------------------------------------
// listing & search
// ---------------------------------------------------------------------------

pub struct ListTablesTool {
    pub context: Arc<BitableToolContext>,
}

#[async_trait]
impl Tool for ListTablesTool {
    fn name(&self) -> &'static str {
        "feishu.v1.bitable.list_tables"
    }

    fn description(&self) -> &'static str {
        "List tables of a bitable app"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::optional(
            "app_token",
            ParamKind::String,
            "bitable app token (defaults from config)",
        )]
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let app_token = self.context.resolve_app_token(&params)?;
        let tables = self.context.api.list_tables(&app_token).await.map_err(upstream_error)?;
        let items: Vec<Value> = tables
            .iter()
            .map(|table| json!({"table_id": table.table_id.0, "name": table.name}))
            .collect();
        Ok(json!({"tables": items}))
    }
}

/// Which search variant a [`SearchTool`] instance exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Plain,
    Exact,
    Keyword,
    Person,
    DateRange,
}

pub struct SearchTool {
    pub context: Arc<BitableToolContext>,
    pub mode: SearchMode,
}

impl SearchTool {
    fn build_filter(&self, params: &Value) -> Result<Option<SearchFilter>, ErrorBody> {
        match self.mode {
            SearchMode::Plain => Ok(None),
            SearchMode::Exact => Ok(Some(SearchFilter::Exact {
                field: required_str(params, "field")?.to_owned(),
                value: required_str(params, "value")?.to_owned(),
            })),
            SearchMode::Keyword => Ok(Some(SearchFilter::Keyword {
                field: required_str(params, "field")?.to_owned(),
                keyword: required_str(params, "keyword")?.to_owned(),
            })),
            SearchMode::Person => Ok(Some(SearchFilter::Person {
                field: required_str(params, "field")?.to_owned(),
                open_id: required_str(params, "open_id")?.to_owned(),
            })),
            SearchMode::DateRange => {
                let from = params.get("from").and_then(Value::as_i64).ok_or_else(|| {
                    ErrorBody::new(ErrorCode::ToolCallFailed, "param `from` must be epoch ms")
                })?;
                let to = params.get("to").and_then(Value::as_i64).ok_or_else(|| {
                    ErrorBody::new(ErrorCode::ToolCallFailed, "param `to` must be epoch ms")
                })?;
                if to < from {
                    return Err(ErrorBody::new(
                        ErrorCode::ToolCallFailed,
                        "param `to` must not precede `from`",
                    ));
                }
                Ok(Some(SearchFilter::DateRange {
                    field: required_str(params, "field")?.to_owned(),
                    from_ms: from,
                    to_ms: to,
                }))
            }
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        match self.mode {
            SearchMode::Plain => "feishu.v1.bitable.search",
            SearchMode::Exact => "feishu.v1.bitable.search_exact",
            SearchMode::Keyword => "feishu.v1.bitable.search_keyword",
            SearchMode::Person => "feishu.v1.bitable.search_person",
            SearchMode::DateRange => "feishu.v1.bitable.search_date_range",
        }
    }

    fn description(&self) -> &'static str {
        match self.mode {
            SearchMode::Plain => "Page through records of a table",
            SearchMode::Exact => "Find records where a field equals a value",
            SearchMode::Keyword => "Find records where a text field contains a keyword",
            SearchMode::Person => "Find records where a person field contains an open_id",
            SearchMode::DateRange => "Find records with a date field inside an epoch-ms range",
        }
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut params = vec![
            ParamSpec::optional("app_token", ParamKind::String, "bitable app token"),
            ParamSpec::optional("table_id", ParamKind::String, "table id"),
            ParamSpec::optional("page_token", ParamKind::String, "pagination cursor"),
            ParamSpec::optional("page_size", ParamKind::Integer, "page size (max 500)"),
        ];
        match self.mode {
            SearchMode::Plain => {}
            SearchMode::Exact => {
                params.push(ParamSpec::required("field", ParamKind::String, "field name"));
                params.push(ParamSpec::required("value", ParamKind::String, "exact value"));
            }
            SearchMode::Keyword => {
                params.push(ParamSpec::required("field", ParamKind::String, "field name"));
                params.push(ParamSpec::required("keyword", ParamKind::String, "substring"));
            }
            SearchMode::Person => {
                params.push(ParamSpec::required("field", ParamKind::String, "person field name"));
                params.push(ParamSpec::required("open_id", ParamKind::String, "opaque user id"));
            }
            SearchMode::DateRange => {
                params.push(ParamSpec::required("field", ParamKind::String, "date field name"));
                params.push(ParamSpec::required("from", ParamKind::Integer, "range start, epoch ms"));
                params.push(ParamSpec::required("to", ParamKind::Integer, "range end, epoch ms"));
            }
        }
        params
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let app_token = self.context.resolve_app_token(&params)?;
        let table_id = self.context.resolve_table_id(&params)?;
        let filter = self.build_filter(&params)?;
        let page_token = params.get("page_token").and_then(Value::as_str);
        let page_size =
            params.get("page_size").and_then(Value::as_i64).unwrap_or(20).clamp(1, 500) as u32;

        let page = self
            .context
            .api
            .search_records(&app_token, &table_id, filter.as_ref(), page_token, page_size, None)
            .await
            .map_err(upstream_error)?;

        Ok(json!({
            "items": page.items.iter().map(encode_record).collect::<Vec<_>>(),
            "has_more": page.has_more,
            "page_token": page.page_token,
        }))
    }
}

// ---------------------------------------------------------------------------
// record CRUD
// ---------------------------------------------------------------------------

pub struct RecordGetTool {
    pub context: Arc<BitableToolContext>,
}

#[async_trait]
impl Tool for RecordGetTool {
    fn name(&self) -> &'static str {
        "feishu.v1.bitable.record.get"
    }

    fn description(&self) -> &'static str {
        "Fetch a single record by id"
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut params = locator_params();
        params.push(ParamSpec::optional(
            "field_names",
            ParamKind::Array,
            "restrict the fetch to these fields",
        ));
        params
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let app_token = self.context.resolve_app_token(&params)?;
        let table_id = self.context.resolve_table_id(&params)?;
        let record_id = RecordId(required_str(&params, "record_id")?.to_owned());
        let field_names: Option<Vec<String>> = params.get("field_names").and_then(Value::as_array).map(|names| {
            names.iter().filter_map(Value::as_str).map(str::to_owned).collect()
        });

        let fields = self
            .context
            .api
            .get_record(&app_token, &table_id, &record_id, field_names.as_deref())
            .await
            .map_err(upstream_error)?;

        match fields {
            Some(fields) => Ok(json!({
                "record_id": record_id.0,
                "fields": encode_fields(&fields),
            })),
            None => Err(ErrorBody::new(
                ErrorCode::NotFound,
                format!("record `{}` not found", record_id.0),
            )),
        }
    }
}

pub struct RecordCreateTool {
    pub context: Arc<BitableToolContext>,
}

#[async_trait]
impl Tool for RecordCreateTool {
    fn name(&self) -> &'static str {
        "feishu.v1.bitable.record.create"
    }

    fn description(&self) -> &'static str {
        "Create a record with the given fields"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::optional("app_token", ParamKind::String, "bitable app token"),
            ParamSpec::optional("table_id", ParamKind::String, "table id"),
            ParamSpec::required("fields", ParamKind::Object, "field name to value map"),
        ]
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let app_token = self.context.resolve_app_token(&params)?;
        let table_id = self.context.resolve_table_id(&params)?;
        let fields = decode_field_map(&params)?;

        let record_id = self
            .context
            .api
            .create_record(&app_token, &table_id, &fields)
            .await
            .map_err(upstream_error)?;

        Ok(json!({
            "record_id": record_id.0,
            "fields": encode_fields(&fields),
        }))
    }
}

pub struct RecordUpdateTool {
    pub context: Arc<BitableToolContext>,
}

#[async_trait]
impl Tool for RecordUpdateTool {
    fn name(&self) -> &'static str {
        "feishu.v1.bitable.record.update"
    }

    fn description(&self) -> &'static str {
        "Partially update a record's fields"
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut params = locator_params();
        params.push(ParamSpec::required("fields", ParamKind::Object, "fields to overwrite"));
        params
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let app_token = self.context.resolve_app_token(&params)?;
        let table_id = self.context.resolve_table_id(&params)?;
        let record_id = RecordId(required_str(&params, "record_id")?.to_owned());
        let fields = decode_field_map(&params)?;

        self.context
            .api
            .update_record(&app_token, &table_id, &record_id, &fields)
            .await
            .map_err(upstream_error)?;

        Ok(json!({"record_id": record_id.0, "updated": true}))
    }
}

pub struct RecordDeleteTool {
    pub context: Arc<BitableToolContext>,
}

#[async_trait]
impl Tool for RecordDeleteTool {
    fn name(&self) -> &'static str {
        "feishu.v1.bitable.record.delete"
    }

    fn description(&self) -> &'static str {
        "Delete a single record by id"
    }

    fn params(&self) -> Vec<ParamSpec> {
        locator_params()
    }

    async fn invoke(&self, params: Value) -> Result<Value, ErrorBody> {
        let app_token = self.context.resolve_app_token(&params)?;
        let table_id = self.context.resolve_table_id(&params)?;
        let record_id = RecordId(required_str(&params, "record_id")?.to_owned());

        let deleted = self
            .context
            .api
            .delete_record(&app_token, &table_id, &record_id)
            .await
            .map_err(upstream_error)?;

        if !deleted {
            return Err(ErrorBody::new(
                ErrorCode::NotFound,
                format!("record `{}` not found", record_id.0),
            ));
        }
        Ok(json!({"record_id": record_id.0, "deleted": true}))
    }
}
