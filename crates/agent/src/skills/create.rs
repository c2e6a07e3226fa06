use async_trait::async_trait;
use casebook_core::chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::session::{PendingAction, PendingKind};
use crate::tool_client::tools;

use super::{extract_field_pairs, resolve_table, Skill, SkillContext, SkillResult, Turn};

const PENDING_TTL_MINUTES: i64 = 30;

/// Single-table create with slot completion across turns and configured
/// multi-table linked writes after the primary succeeds.
pub struct CreateSkill;

#[async_trait]
impl Skill for CreateSkill {
    fn name(&self) -> &'static str {
        "create"
    }

    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        let mut slots: Map<String, Value> = Map::new();

        // Resume a complete_fields continuation: the forced payload carries
        // previously collected slots plus the user's fill value.
        if let Some(payload) = turn.forced_payload.clone() {
            if payload.get("resume").and_then(Value::as_str) == Some("fill") {
                if let Some(saved) = payload.get("slots").and_then(Value::as_object) {
                    for (name, value) in saved {
                        if name != "missing" {
                            slots.insert(name.clone(), value.clone());
                        }
                    }
                }
                let missing: Vec<String> = payload
                    .pointer("/slots/missing")
                    .and_then(Value::as_array)
                    .map(|fields| {
                        fields
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                if let (Some(field), Some(value)) =
                    (missing.first(), payload.get("value").and_then(Value::as_str))
                {
                    slots.insert(field.clone(), Value::String(value.trim().to_owned()));
                }
            }
        }

        for (field, value) in extract_field_pairs(turn.text, &context.settings.known_fields) {
            slots.entry(field).or_insert(Value::String(value));
        }

        let missing: Vec<String> = context
            .settings
            .required_create_fields
            .iter()
            .filter(|field| !slots.contains_key(*field))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let ask = missing[0].clone();
            let mut payload = slots.clone();
            payload.insert(
                "missing".to_owned(),
                Value::Array(missing.iter().cloned().map(Value::String).collect()),
            );
            turn.state.set_pending(PendingAction {
                kind: PendingKind::CompleteFields,
                owner_skill: "create",
                target_record_id: None,
                target_table_id: None,
                summary: format!("新建案件（待补全 {ask}）"),
                payload: Value::Object(payload),
                expires_at: Utc::now() + Duration::minutes(PENDING_TTL_MINUTES),
            });
            return SkillResult::ok(format!("还差一项：请补充「{ask}」。"));
        }

        let (app_token, table_id, _confidence) = resolve_table(context, turn.text).await;
        let create_params = json!({
            "app_token": app_token,
            "table_id": table_id,
            "fields": Value::Object(slots.clone()),
        });

        let created = match context.tools.call(tools::RECORD_CREATE, create_params).await {
            Ok(data) => data,
            Err(error) => {
                warn!(
                    event_name = "agent.skill.create_failed",
                    error = %error,
                    "primary create failed"
                );
                return SkillResult::failed(error.user_message());
            }
        };
        let record_id = created
            .get("record_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        turn.state.active_record = Some(record_id.clone());
        turn.state.active_table = Some(table_id.clone());

        let mut message = format!("已创建案件记录 {record_id}。");
        let mut linked_failures = Vec::new();

        for linked in &context.settings.linked_writes {
            if linked.source_table_id != table_id {
                continue;
            }
            let mut secondary = Map::new();
            secondary
                .insert(linked.link_field.clone(), Value::String(record_id.clone()));
            for field in &linked.copy_fields {
                if let Some(value) = slots.get(field) {
                    secondary.insert(field.clone(), value.clone());
                }
            }
            let params = json!({
                "table_id": linked.target_table_id,
                "fields": Value::Object(secondary),
            });
            match context.tools.call(tools::RECORD_CREATE, params.clone()).await {
                Ok(_) => {
                    info!(
                        event_name = "agent.skill.linked_write_done",
                        linked = %linked.name,
                        record_id = %record_id,
                        "secondary write finished"
                    );
                }
                Err(error) => {
                    // The primary record is preserved; record a dialogue
                    // retry task so the user can finish the sub-write later.
                    warn!(
                        event_name = "agent.skill.linked_write_failed",
                        linked = %linked.name,
                        record_id = %record_id,
                        error = %error,
                        "secondary write failed, retry task recorded"
                    );
                    turn.state.slot_memory.insert(
                        format!("linked_write_retry:{}", linked.name),
                        json!({
                            "linked": linked.name,
                            "record_id": record_id,
                            "params": params,
                        })
                        .to_string(),
                    );
                    linked_failures.push(linked.name.clone());
                }
            }
        }

        if !linked_failures.is_empty() {
            message.push_str(&format!(
                "关联表写入（{}）暂时失败，已记录待重试，稍后可让我继续完成。",
                linked_failures.join("、")
            ));
        }

        SkillResult::ok_with_data(
            message,
            json!({"record_id": record_id, "fields": created.get("fields").cloned()}),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::session::ConversationState;
    use crate::skills::test_support::{context_with, FakeTools};
    use crate::skills::{LinkedWrite, Skill, Turn};

    use super::CreateSkill;

    fn turn<'a>(
        text: &'a str,
        state: &'a mut ConversationState,
        forced: Option<serde_json::Value>,
    ) -> Turn<'a> {
        Turn { open_id: "ou_A", text, state, forced_payload: forced, chained_data: None }
    }

    #[tokio::test]
    async fn missing_required_field_creates_a_complete_fields_pending() {
        let tools = Arc::new(FakeTools::default());
        let context = context_with(tools.clone());
        let mut state = ConversationState::default();

        let result = CreateSkill
            .handle(
                &context,
                &mut turn("新建案件 案号 (2026)沪01民终1号 委托人 张三", &mut state, None),
            )
            .await;

        assert!(result.ok);
        assert!(result.message.contains("案由"));
        let pending = state.pending().expect("pending action");
        assert_eq!(pending.owner_skill, "create");
        assert_eq!(pending.payload["案号"], "(2026)沪01民终1号");
        assert_eq!(tools.calls.lock().await.len(), 0, "no tool call before slots complete");
    }

    #[tokio::test]
    async fn fill_resume_completes_the_create() {
        let tools = Arc::new(FakeTools::default());
        let context = context_with(tools.clone());
        let mut state = ConversationState::default();

        let result = CreateSkill
            .handle(
                &context,
                &mut turn(
                    "合同纠纷",
                    &mut state,
                    Some(json!({
                        "resume": "fill",
                        "value": "合同纠纷",
                        "slots": {
                            "案号": "(2026)沪01民终1号",
                            "委托人": "张三",
                            "missing": ["案由"]
                        }
                    })),
                ),
            )
            .await;

        assert!(result.ok, "{}", result.message);
        assert!(result.message.contains("已创建"));
        let records = tools.records.lock().await;
        let (_, fields) = records.iter().next().expect("created record");
        assert_eq!(fields["案由"], "合同纠纷");
        assert_eq!(fields["委托人"], "张三");
    }

    fn linked_writes() -> Vec<LinkedWrite> {
        vec![LinkedWrite {
            name: "case_to_contract".into(),
            source_table_id: "tblCases".into(),
            target_table_id: "tblContracts".into(),
            copy_fields: vec!["案号".into()],
            link_field: "源案件".into(),
        }]
    }

    #[tokio::test]
    async fn linked_write_runs_after_a_successful_primary() {
        let tools = Arc::new(FakeTools::default());
        let mut context = context_with(tools.clone());
        context.settings.linked_writes = linked_writes();
        let mut state = ConversationState::default();

        let result = CreateSkill
            .handle(
                &context,
                &mut turn("新建案件 案号 A-1 委托人 张三 案由 合同纠纷", &mut state, None),
            )
            .await;
        assert!(result.ok);
        assert_eq!(tools.calls_for("feishu.v1.bitable.record.create").await, 2);

        let calls = tools.calls.lock().await;
        let linked_call = &calls[1].1;
        assert_eq!(linked_call["table_id"], "tblContracts");
        assert_eq!(linked_call["fields"]["案号"], "A-1");
        assert!(linked_call["fields"]["源案件"].as_str().expect("link").starts_with("rec"));
    }

    #[tokio::test]
    async fn linked_write_failure_preserves_primary_and_records_retry() {
        let tools = Arc::new(FakeTools::default());
        // Primary create succeeds; the second create (the linked write) fails.
        tools.fail_on_after("feishu.v1.bitable.record.create", 1).await;
        let mut context = context_with(tools.clone());
        context.settings.linked_writes = linked_writes();
        let mut state = ConversationState::default();

        let result = CreateSkill
            .handle(
                &context,
                &mut turn("新建案件 案号 A-1 委托人 张三 案由 合同纠纷", &mut state, None),
            )
            .await;

        assert!(result.ok, "primary result is preserved");
        assert!(result.message.contains("已创建"));
        assert!(result.message.contains("待重试"));
        assert_eq!(tools.records.lock().await.len(), 1, "primary record exists");
        assert!(
            state.slot_memory.keys().any(|key| key.starts_with("linked_write_retry:")),
            "dialogue retry task recorded"
        );
    }

    #[tokio::test]
    async fn created_record_becomes_the_active_record() {
        let tools = Arc::new(FakeTools::default());
        let context = context_with(tools);
        let mut state = ConversationState::default();

        CreateSkill
            .handle(
                &context,
                &mut turn("新建案件 案号 A-9 委托人 王五 案由 劳动争议", &mut state, None),
            )
            .await;
        assert!(state.active_record.is_some());
        assert_eq!(state.active_table.as_deref(), Some("tblCases"));
    }
}
