use std::sync::Arc;

use async_trait::async_trait;
use casebook_db::ReminderStore;
use casebook_feishu::Block;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::LlmClient;
use crate::session::ConversationState;
use crate::tool_client::ToolClient;

pub mod chitchat;
pub mod create;
pub mod delete;
pub mod query;
pub mod reminder;
pub mod summary;
pub mod update;

pub use chitchat::ChitchatSkill;
pub use create::CreateSkill;
pub use delete::DeleteSkill;
pub use query::QuerySkill;
pub use reminder::ReminderSkill;
pub use summary::SummarySkill;
pub use update::UpdateSkill;

/// Uniform result every skill emits.
#[derive(Clone, Debug, Default)]
pub struct SkillResult {
    pub ok: bool,
    /// Structured payload handed to the next skill in a chain.
    pub data: Option<Value>,
    pub message: String,
    pub next_skill: Option<String>,
    pub blocks: Option<Vec<Block>>,
    /// Stable refusal/short-circuit code (e.g. `delete_disabled`).
    pub code: Option<&'static str>,
}

impl SkillResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into(), ..Self::default() }
    }

    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self { ok: true, message: message.into(), data: Some(data), ..Self::default() }
    }

    pub fn refused(message: impl Into<String>, code: &'static str) -> Self {
        Self { ok: false, message: message.into(), code: Some(code), ..Self::default() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into(), ..Self::default() }
    }
}

/// Table alias configuration plus query/mutation defaults shared by skills.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillSettings {
    pub default_app_token: String,
    pub default_table_id: String,
    pub table_aliases: Vec<casebook_core::config::TableAlias>,
    /// Person field queried for "my cases".
    pub person_field: String,
    /// Date field queried for hearing-date ranges.
    pub date_field: String,
    /// Exact-match field for case numbers.
    pub case_no_field: String,
    /// Table recognition below this confidence asks the LLM to pick from a
    /// shortlist. Destructive operations are never auto-confirmed regardless.
    pub auto_confirm_threshold: f64,
    pub required_create_fields: Vec<String>,
    pub known_fields: Vec<String>,
    pub linked_writes: Vec<LinkedWrite>,
}

/// One-directional secondary write after a successful primary create.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkedWrite {
    pub name: String,
    pub source_table_id: String,
    pub target_table_id: String,
    /// Fields copied from the primary record into the secondary one.
    pub copy_fields: Vec<String>,
    /// Target field that receives the primary record id.
    pub link_field: String,
}

impl Default for SkillSettings {
    fn default() -> Self {
        Self {
            default_app_token: String::new(),
            default_table_id: String::new(),
            table_aliases: Vec::new(),
            person_field: "主办律师".to_owned(),
            date_field: "开庭日".to_owned(),
            case_no_field: "案号".to_owned(),
            auto_confirm_threshold: 0.65,
            required_create_fields: vec![
                "案号".to_owned(),
                "委托人".to_owned(),
                "案由".to_owned(),
            ],
            known_fields: vec![
                "案号".to_owned(),
                "委托人".to_owned(),
                "案由".to_owned(),
                "开庭日".to_owned(),
                "主办律师".to_owned(),
                "审理法院".to_owned(),
                "状态".to_owned(),
            ],
            linked_writes: Vec::new(),
        }
    }
}

/// Shared collaborators injected into every skill.
pub struct SkillContext {
    pub tools: Arc<dyn ToolClient>,
    pub task_llm: Option<Arc<dyn LlmClient>>,
    pub chat_llm: Option<Arc<dyn LlmClient>>,
    pub reminders: Option<Arc<ReminderStore>>,
    pub settings: SkillSettings,
}

/// One conversational turn as a skill sees it.
pub struct Turn<'a> {
    pub open_id: &'a str,
    pub text: &'a str,
    pub state: &'a mut ConversationState,
    /// Payload from an L0 forced dispatch (confirmations, pagination, ...).
    pub forced_payload: Option<Value>,
    /// Data produced by the previous skill in a chain.
    pub chained_data: Option<Value>,
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult;
}

/// Resolves the target table from alias mentions. Returns
/// `(app_token, table_id, confidence)`; ambiguity drops the confidence below
/// the auto-confirm threshold so callers can consult the LLM shortlist.
pub async fn resolve_table(
    context: &SkillContext,
    text: &str,
) -> (String, String, f64) {
    let settings = &context.settings;
    let mut hits: Vec<&casebook_core::config::TableAlias> = settings
        .table_aliases
        .iter()
        .filter(|alias| {
            text.contains(&alias.name)
                || alias.aliases.iter().any(|name| !name.is_empty() && text.contains(name))
        })
        .collect();

    match hits.len() {
        0 => (settings.default_app_token.clone(), settings.default_table_id.clone(), 1.0),
        1 => (settings.default_app_token.clone(), hits[0].table_id.clone(), 1.0),
        _ => {
            // Ambiguous mention: confidence under the threshold, ask the task
            // model to pick from the shortlist when available.
            if let Some(llm) = &context.task_llm {
                let shortlist: Vec<String> = hits
                    .iter()
                    .map(|alias| format!("{} ({})", alias.name, alias.table_id))
                    .collect();
                let prompt = format!(
                    "用户提到的数据表有歧义。用户输入：{text}\n候选表：\n{}\n只返回 JSON：{{\"table_id\": \"...\"}}",
                    shortlist.join("\n")
                );
                if let Ok(choice) = llm.complete_json(&prompt).await {
                    if let Some(table_id) = choice.get("table_id").and_then(Value::as_str) {
                        if hits.iter().any(|alias| alias.table_id == table_id) {
                            return (
                                settings.default_app_token.clone(),
                                table_id.to_owned(),
                                settings.auto_confirm_threshold,
                            );
                        }
                    }
                }
            }
            let first = hits.remove(0);
            (settings.default_app_token.clone(), first.table_id.clone(), 0.5)
        }
    }
}

/// Extracts `field value` pairs for the known field vocabulary from free
/// text, e.g. "新建案件 案号 (2026)沪01民终1号 委托人 张三".
pub fn extract_field_pairs(
    text: &str,
    known_fields: &[String],
) -> std::collections::BTreeMap<String, String> {
    let mut pairs = std::collections::BTreeMap::new();
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let mut index = 0;
    while index < tokens.len() {
        let token = tokens[index];
        if let Some(field) = known_fields.iter().find(|field| token == field.as_str()) {
            let mut value_parts = Vec::new();
            let mut next = index + 1;
            while next < tokens.len()
                && !known_fields.iter().any(|field| tokens[next] == field.as_str())
            {
                value_parts.push(tokens[next]);
                next += 1;
            }
            if !value_parts.is_empty() {
                pairs.insert(field.clone(), value_parts.join(" "));
            }
            index = next;
        } else {
            index += 1;
        }
    }
    pairs
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use casebook_core::{AgentError, ErrorCode};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use crate::tool_client::ToolClient;

    use super::{SkillContext, SkillSettings};

    /// In-memory tool server covering the record surface skills use.
    #[derive(Default)]
    pub struct FakeTools {
        pub records: Mutex<HashMap<String, Value>>,
        pub calls: Mutex<Vec<(String, Value)>>,
        /// `(tool, after)` — fail calls to `tool` once `after` prior calls to
        /// it have gone through.
        pub fail_tools: Mutex<Vec<(String, usize)>>,
    }

    impl FakeTools {
        pub async fn seed(&self, record_id: &str, fields: Value) {
            self.records.lock().await.insert(record_id.to_owned(), fields);
        }

        pub async fn fail_on(&self, tool: &str) {
            self.fail_tools.lock().await.push((tool.to_owned(), 0));
        }

        pub async fn fail_on_after(&self, tool: &str, after: usize) {
            self.fail_tools.lock().await.push((tool.to_owned(), after));
        }

        pub async fn calls_for(&self, tool: &str) -> usize {
            self.calls.lock().await.iter().filter(|(name, _)| name == tool).count()
        }
    }

    #[async_trait]
    impl ToolClient for FakeTools {
        async fn call(&self, tool: &str, params: Value) -> Result<Value, AgentError> {
            let prior = {
                let mut calls = self.calls.lock().await;
                calls.push((tool.to_owned(), params.clone()));
                calls.iter().filter(|(name, _)| name == tool).count() - 1
            };
            let should_fail = self
                .fail_tools
                .lock()
                .await
                .iter()
                .any(|(name, after)| name == tool && prior >= *after);
            if should_fail {
                return Err(AgentError::ToolFailed {
                    tool: tool.to_owned(),
                    code: ErrorCode::ToolCallFailed,
                    message: "injected failure".into(),
                });
            }

            let mut records = self.records.lock().await;
            match tool {
                "feishu.v1.bitable.record.create" => {
                    let record_id = format!("rec{:04}", records.len() + 1);
                    records.insert(record_id.clone(), params["fields"].clone());
                    Ok(json!({"record_id": record_id, "fields": params["fields"]}))
                }
                "feishu.v1.bitable.record.get" => {
                    let record_id = params["record_id"].as_str().unwrap_or_default();
                    match records.get(record_id) {
                        Some(fields) => {
                            Ok(json!({"record_id": record_id, "fields": fields}))
                        }
                        None => Err(AgentError::ToolFailed {
                            tool: tool.to_owned(),
                            code: ErrorCode::NotFound,
                            message: "record not found".into(),
                        }),
                    }
                }
                "feishu.v1.bitable.record.update" => {
                    let record_id = params["record_id"].as_str().unwrap_or_default();
                    match records.get_mut(record_id) {
                        Some(existing) => {
                            if let (Some(existing), Some(updates)) =
                                (existing.as_object_mut(), params["fields"].as_object())
                            {
                                for (name, value) in updates {
                                    existing.insert(name.clone(), value.clone());
                                }
                            }
                            Ok(json!({"record_id": record_id, "updated": true}))
                        }
                        None => Err(AgentError::ToolFailed {
                            tool: tool.to_owned(),
                            code: ErrorCode::NotFound,
                            message: "record not found".into(),
                        }),
                    }
                }
                "feishu.v1.bitable.record.delete" => {
                    let record_id = params["record_id"].as_str().unwrap_or_default();
                    match records.remove(record_id) {
                        Some(_) => Ok(json!({"record_id": record_id, "deleted": true})),
                        None => Err(AgentError::ToolFailed {
                            tool: tool.to_owned(),
                            code: ErrorCode::NotFound,
                            message: "record not found".into(),
                        }),
                    }
                }
                name if name.starts_with("feishu.v1.bitable.search") => {
                    let items: Vec<Value> = records
                        .iter()
                        .filter(|(_, fields)| match name {
                            "feishu.v1.bitable.search_exact" => {
                                let field = params["field"].as_str().unwrap_or_default();
                                let value = params["value"].as_str().unwrap_or_default();
                                fields.get(field).and_then(Value::as_str) == Some(value)
                            }
                            "feishu.v1.bitable.search_person" => {
                                let field = params["field"].as_str().unwrap_or_default();
                                let open_id = params["open_id"].as_str().unwrap_or_default();
                                fields
                                    .get(field)
                                    .and_then(Value::as_array)
                                    .map(|people| {
                                        people.iter().any(|person| {
                                            person.get("id").and_then(Value::as_str)
                                                == Some(open_id)
                                        })
                                    })
                                    .unwrap_or(false)
                            }
                            "feishu.v1.bitable.search_date_range" => {
                                let field = params["field"].as_str().unwrap_or_default();
                                let from = params["from"].as_i64().unwrap_or(i64::MIN);
                                let to = params["to"].as_i64().unwrap_or(i64::MAX);
                                fields
                                    .get(field)
                                    .and_then(Value::as_i64)
                                    .map(|ms| ms >= from && ms <= to)
                                    .unwrap_or(false)
                            }
                            _ => true,
                        })
                        .map(|(record_id, fields)| {
                            json!({"record_id": record_id, "fields": fields})
                        })
                        .collect();
                    Ok(json!({"items": items, "has_more": false, "page_token": null}))
                }
                other => Err(AgentError::ToolFailed {
                    tool: other.to_owned(),
                    code: ErrorCode::NotFound,
                    message: format!("unknown tool `{other}`"),
                }),
            }
        }
    }

    pub fn context_with(tools: Arc<FakeTools>) -> SkillContext {
        let mut settings = SkillSettings::default();
        settings.default_app_token = "appA".into();
        settings.default_table_id = "tblCases".into();
        SkillContext { tools, task_llm: None, chat_llm: None, reminders: None, settings }
    }
}

#[cfg(test)]
mod tests {
    use super::extract_field_pairs;

    #[test]
    fn field_pairs_parse_in_declaration_order() {
        let known = vec!["案号".to_owned(), "委托人".to_owned(), "案由".to_owned()];
        let pairs =
            extract_field_pairs("新建案件 案号 (2026)沪01民终1号 委托人 张三", &known);
        assert_eq!(pairs.get("案号").map(String::as_str), Some("(2026)沪01民终1号"));
        assert_eq!(pairs.get("委托人").map(String::as_str), Some("张三"));
        assert!(!pairs.contains_key("案由"));
    }

    #[test]
    fn multi_token_values_are_joined() {
        let known = vec!["案由".to_owned(), "委托人".to_owned()];
        let pairs = extract_field_pairs("案由 劳动 争议 纠纷 委托人 李四", &known);
        assert_eq!(pairs.get("案由").map(String::as_str), Some("劳动 争议 纠纷"));
    }
}
