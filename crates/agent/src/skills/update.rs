use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::tool_client::tools;

use super::{extract_field_pairs, Skill, SkillContext, SkillResult, Turn};

/// Single-record partial update. Requires the locator triplet; the record
/// comes from the active-record slot or an explicit case-number mention.
pub struct UpdateSkill;

#[async_trait]
impl Skill for UpdateSkill {
    fn name(&self) -> &'static str {
        "update"
    }

    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        let mut fields = extract_field_pairs(turn.text, &context.settings.known_fields);
        // "把状态改成已结案" style: field 改成/改为/更新为 value.
        if fields.is_empty() {
            if let Some((field, value)) = parse_change_phrase(turn.text, &context.settings.known_fields) {
                fields.insert(field, value);
            }
        }
        if fields.is_empty() {
            return SkillResult::ok(
                "请告诉我要修改哪个字段和新值，例如：状态 改成 已结案。",
            );
        }

        let record_id = match self.locate_record(context, turn, &fields).await {
            Some(record_id) => record_id,
            None => {
                return SkillResult::ok(
                    "我不确定要修改哪条记录，请先查询并选中一条（例如“第1个”），或给出案号。",
                )
            }
        };

        let table_id = turn
            .state
            .active_table
            .clone()
            .unwrap_or_else(|| context.settings.default_table_id.clone());
        let field_values: Value = fields
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into();

        let params = json!({
            "app_token": context.settings.default_app_token,
            "table_id": table_id,
            "record_id": record_id,
            "fields": field_values,
        });

        match context.tools.call(tools::RECORD_UPDATE, params).await {
            Ok(_) => {
                let summary: Vec<String> = fields
                    .iter()
                    .map(|(name, value)| format!("{name} → {value}"))
                    .collect();
                SkillResult::ok_with_data(
                    format!("已更新记录 {record_id}：{}", summary.join("，")),
                    json!({"record_id": record_id}),
                )
            }
            Err(error) => {
                warn!(
                    event_name = "agent.skill.update_failed",
                    record_id = %record_id,
                    error = %error,
                    "update tool call failed"
                );
                SkillResult::failed(error.user_message())
            }
        }
    }
}

impl UpdateSkill {
    /// Active record first; otherwise resolve an explicit case number.
    async fn locate_record(
        &self,
        context: &SkillContext,
        turn: &Turn<'_>,
        parsed_fields: &std::collections::BTreeMap<String, String>,
    ) -> Option<String> {
        if let Some(case_no) = parsed_fields.get(&context.settings.case_no_field) {
            let params = json!({
                "field": context.settings.case_no_field,
                "value": case_no,
            });
            if let Ok(data) = context.tools.call(tools::SEARCH_EXACT, params).await {
                if let Some(record_id) = data
                    .pointer("/items/0/record_id")
                    .and_then(Value::as_str)
                {
                    return Some(record_id.to_owned());
                }
            }
        }
        turn.state.active_record.clone()
    }
}

/// "状态 改成 已结案" / "状态改为已结案" — only for known fields.
fn parse_change_phrase(text: &str, known_fields: &[String]) -> Option<(String, String)> {
    for marker in ["改成", "改为", "更新为", "变更为"] {
        if let Some(position) = text.find(marker) {
            let (left, right) = text.split_at(position);
            let value = right[marker.len()..].trim().trim_matches(|ch: char| "。！!".contains(ch));
            let field = known_fields
                .iter()
                .find(|field| left.contains(field.as_str()))?;
            if !value.is_empty() {
                return Some((field.clone(), value.to_owned()));
            }
        }
    }
    None
}
