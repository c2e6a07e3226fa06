use async_trait::async_trait;
use casebook_db::{stores::reminder::NewReminder, ReminderPriority, ReminderStatus};
use serde_json::json;
use tracing::warn;

use crate::timeparse::{now_local, parse_reminder_time};

use super::{Skill, SkillContext, SkillResult, Turn};

/// Reminder CRUD against the durable store. Natural-language times are parsed
/// in the conversation timezone; past times are refused with a clarification.
pub struct ReminderSkill;

#[async_trait]
impl Skill for ReminderSkill {
    fn name(&self) -> &'static str {
        "reminder"
    }

    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        let Some(store) = &context.reminders else {
            return SkillResult::failed("提醒功能未启用。");
        };
        let text = turn.text.trim();

        if text.contains("提醒列表") || text.contains("查看提醒") || text.contains("我的提醒") {
            return self.list(store, turn).await;
        }
        if let Some(index) = command_index(text, &["完成提醒", "完成第"]) {
            return self.resolve(store, turn, index, ReminderStatus::Done).await;
        }
        if let Some(index) = command_index(text, &["删除提醒", "删除第"]) {
            return self.resolve(store, turn, index, ReminderStatus::Cancelled).await;
        }

        self.create(store, turn).await
    }
}

impl ReminderSkill {
    async fn create(
        &self,
        store: &casebook_db::ReminderStore,
        turn: &mut Turn<'_>,
    ) -> SkillResult {
        let now = now_local();
        let Some(parsed) = parse_reminder_time(turn.text, now) else {
            return SkillResult::ok(
                "请告诉我提醒时间，例如：明天 9 点提醒我准备开庭材料。",
            );
        };

        if parsed.at <= now {
            return SkillResult::ok(
                "这个时间已经过去了，提醒没有创建。换一个将来的时间试试？",
            );
        }

        let reminder = NewReminder {
            user_id: turn.open_id.to_owned(),
            content: turn.text.to_owned(),
            due_at: parsed.at.timestamp_millis(),
            priority: ReminderPriority::Medium,
            case_id: turn.state.active_record.clone(),
            chat_id: None,
            source: "manual".to_owned(),
        };

        match store.create(reminder).await {
            Ok(created) => {
                let when = parsed.at.format("%m月%d日 %H:%M");
                let label = if parsed.used_default_time { "（默认 18:00）" } else { "" };
                SkillResult::ok_with_data(
                    format!("好的，已设置提醒：{when}{label}。"),
                    json!({"reminder_id": created.id, "due_at": created.due_at}),
                )
            }
            Err(error) => {
                warn!(
                    event_name = "agent.skill.reminder_create_failed",
                    error = %error,
                    "reminder persistence failed"
                );
                SkillResult::failed("提醒保存失败，请稍后再试。")
            }
        }
    }

    async fn list(
        &self,
        store: &casebook_db::ReminderStore,
        turn: &mut Turn<'_>,
    ) -> SkillResult {
        match store.list_for_user(turn.open_id, Some(ReminderStatus::Pending), 20).await {
            Ok(reminders) if reminders.is_empty() => {
                SkillResult::ok("当前没有待办提醒。")
            }
            Ok(reminders) => {
                turn.state.last_result_ids =
                    reminders.iter().map(|reminder| reminder.id.clone()).collect();
                let mut lines = vec![format!("共有 {} 条待办提醒：", reminders.len())];
                for (index, reminder) in reminders.iter().enumerate() {
                    lines.push(format!("{}. {}", index + 1, reminder.content));
                }
                lines.push("可以说“完成提醒 1”或“删除提醒 2”。".to_owned());
                SkillResult::ok(lines.join("\n"))
            }
            Err(error) => {
                warn!(
                    event_name = "agent.skill.reminder_list_failed",
                    error = %error,
                    "reminder listing failed"
                );
                SkillResult::failed("暂时读不到提醒列表，请稍后再试。")
            }
        }
    }

    async fn resolve(
        &self,
        store: &casebook_db::ReminderStore,
        turn: &mut Turn<'_>,
        index: usize,
        status: ReminderStatus,
    ) -> SkillResult {
        let pending = match store
            .list_for_user(turn.open_id, Some(ReminderStatus::Pending), 20)
            .await
        {
            Ok(pending) => pending,
            Err(_) => return SkillResult::failed("暂时读不到提醒列表，请稍后再试。"),
        };
        let Some(target) = index.checked_sub(1).and_then(|index| pending.get(index)) else {
            return SkillResult::ok(format!(
                "当前只有 {} 条待办提醒，请重新指定序号。",
                pending.len()
            ));
        };

        match store.set_status(&target.id, turn.open_id, status).await {
            Ok(true) => {
                let verb = if status == ReminderStatus::Done { "已完成" } else { "已删除" };
                SkillResult::ok(format!("{verb}提醒：{}", target.content))
            }
            _ => SkillResult::failed("操作没有成功，请稍后再试。"),
        }
    }
}

/// "完成提醒 2" → 2. Defaults to 1 when no number follows.
fn command_index(text: &str, prefixes: &[&str]) -> Option<usize> {
    for prefix in prefixes {
        if let Some(position) = text.find(prefix) {
            let rest = &text[position + prefix.len()..];
            let digits: String =
                rest.chars().skip_while(|ch| ch.is_whitespace()).take_while(char::is_ascii_digit).collect();
            return Some(digits.parse().unwrap_or(1));
        }
    }
    None
}
