use async_trait::async_trait;
use casebook_core::chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::session::{PendingAction, PendingKind};
use crate::tool_client::tools;

use super::{Skill, SkillContext, SkillResult, Turn};

const PENDING_TTL_MINUTES: i64 = 30;
const BULK_MARKERS: &[&str] = &["所有", "全部", "批量", "一切"];

/// Destructive single-record delete. Always goes through a `confirm_delete`
/// pending action; bulk phrasing is refused outright with a stable code.
pub struct DeleteSkill;

#[async_trait]
impl Skill for DeleteSkill {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        // Confirmed continuation from L0: execute the delete now.
        if let Some(payload) = turn.forced_payload.clone() {
            if payload.get("resume").and_then(Value::as_str) == Some("confirm") {
                return self.execute_confirmed(context, turn, &payload).await;
            }
        }

        if BULK_MARKERS.iter().any(|marker| turn.text.contains(marker)) {
            info!(
                event_name = "agent.skill.delete_refused",
                open_id = %turn.open_id,
                "bulk delete blocked by safety guard"
            );
            return SkillResult::refused(
                "不支持批量删除操作，请指定具体案件后再删除。",
                "delete_disabled",
            );
        }

        let Some((record_id, label)) = self.locate_record(context, turn).await else {
            return SkillResult::ok(
                "我不确定要删除哪条记录，请先查询并选中一条，或给出案号。",
            );
        };

        let table_id = turn
            .state
            .active_table
            .clone()
            .unwrap_or_else(|| context.settings.default_table_id.clone());
        let superseded = turn.state.set_pending(PendingAction {
            kind: PendingKind::ConfirmDelete,
            owner_skill: "delete",
            target_record_id: Some(record_id.clone()),
            target_table_id: Some(table_id),
            summary: format!("删除 {label}"),
            payload: json!({"label": label}),
            expires_at: Utc::now() + Duration::minutes(PENDING_TTL_MINUTES),
        });

        let mut message =
            format!("确定要删除 {label} 吗？回复“确认”执行，回复“取消”放弃。");
        if let Some(old) = superseded {
            message = format!("（已取消先前待确认操作：{}）\n{message}", old.summary);
        }

        SkillResult {
            ok: true,
            data: None,
            message,
            next_skill: None,
            blocks: Some(vec![casebook_feishu::Block::Confirm {
                confirm_text: "确认".to_owned(),
                cancel_text: "取消".to_owned(),
            }]),
            code: None,
        }
    }
}

impl DeleteSkill {
    async fn execute_confirmed(
        &self,
        context: &SkillContext,
        turn: &mut Turn<'_>,
        payload: &Value,
    ) -> SkillResult {
        let Some(record_id) = payload.get("record_id").and_then(Value::as_str) else {
            return SkillResult::failed("待删除的记录信息已失效，请重新操作。");
        };
        let table_id = payload
            .get("table_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| context.settings.default_table_id.clone());

        let params = json!({
            "app_token": context.settings.default_app_token,
            "table_id": table_id,
            "record_id": record_id,
        });
        match context.tools.call(tools::RECORD_DELETE, params).await {
            Ok(_) => {
                if turn.state.active_record.as_deref() == Some(record_id) {
                    turn.state.active_record = None;
                }
                turn.state.last_result_ids.retain(|id| id != record_id);
                SkillResult::ok_with_data(
                    "已删除该记录。".to_owned(),
                    json!({"record_id": record_id, "deleted": true}),
                )
            }
            Err(error) => {
                warn!(
                    event_name = "agent.skill.delete_failed",
                    record_id,
                    error = %error,
                    "delete tool call failed"
                );
                SkillResult::failed(error.user_message())
            }
        }
    }

    /// Explicit id token, case-number lookup, then the active record.
    async fn locate_record(
        &self,
        context: &SkillContext,
        turn: &Turn<'_>,
    ) -> Option<(String, String)> {
        // "删除 P-0042" style tokens double as case-number candidates.
        let token = turn
            .text
            .split_whitespace()
            .find(|token| {
                token.starts_with("rec")
                    || token.chars().any(|ch| ch.is_ascii_digit())
                        && token.chars().any(|ch| ch.is_ascii_alphanumeric())
                        && *token != "删除"
            })
            .map(str::to_owned);

        if let Some(token) = token {
            if token.starts_with("rec") {
                return Some((token.clone(), token));
            }
            let params = json!({
                "field": context.settings.case_no_field,
                "value": token,
            });
            if let Ok(data) = context.tools.call(tools::SEARCH_EXACT, params).await {
                if let Some(record_id) =
                    data.pointer("/items/0/record_id").and_then(Value::as_str)
                {
                    return Some((record_id.to_owned(), token));
                }
            }
        }

        turn.state
            .active_record
            .clone()
            .map(|record_id| (record_id.clone(), format!("记录 {record_id}")))
    }
}
