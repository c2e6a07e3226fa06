use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Skill, SkillContext, SkillResult, Turn};

/// Summarizes the preceding query result (chained data first, then the
/// conversation's last result). With nothing to summarize it answers with a
/// friendly message — never a chained error.
pub struct SummarySkill;

#[async_trait]
impl Skill for SummarySkill {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        let source = turn
            .chained_data
            .clone()
            .or_else(|| turn.state.last_result.clone());

        let items = source
            .as_ref()
            .and_then(|data| data.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if items.is_empty() {
            return SkillResult::ok(
                "刚才的查询没有结果，暂时没有可以总结的内容。可以换个条件再查一次。",
            );
        }

        let digest = deterministic_digest(&items);
        if let Some(llm) = &context.chat_llm {
            let prompt = format!(
                "请用三句话以内总结以下案件列表，突出数量、主要案由和最近的开庭安排：\n{digest}"
            );
            match llm.complete(&prompt).await {
                Ok(text) if !text.trim().is_empty() => {
                    return SkillResult::ok_with_data(text.trim().to_owned(), Value::Array(items))
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        event_name = "agent.skill.summary_llm_failed",
                        error = %error,
                        "summary model unavailable, using the deterministic digest"
                    );
                }
            }
        }

        SkillResult::ok_with_data(digest, Value::Array(items))
    }
}

fn deterministic_digest(items: &[Value]) -> String {
    let mut lines = vec![format!("共 {} 条记录：", items.len())];
    for item in items.iter().take(10) {
        let empty = Value::Null;
        let fields = item.get("fields").unwrap_or(&empty);
        let case_no = fields.get("案号").and_then(Value::as_str).unwrap_or("未知案号");
        let cause = fields.get("案由").and_then(Value::as_str).unwrap_or("未知案由");
        lines.push(format!("- {case_no}（{cause}）"));
    }
    if items.len() > 10 {
        lines.push(format!("…… 以及另外 {} 条。", items.len() - 10));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use casebook_core::AgentError;
    use serde_json::json;

    use crate::llm::LlmClient;
    use crate::session::ConversationState;
    use crate::skills::test_support::{context_with, FakeTools};
    use crate::skills::{Skill, Turn};

    use super::SummarySkill;

    struct CannedLlm(String);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
    }

    fn turn<'a>(
        state: &'a mut ConversationState,
        chained: Option<serde_json::Value>,
    ) -> Turn<'a> {
        Turn { open_id: "ou_A", text: "总结一下", state, forced_payload: None, chained_data: chained }
    }

    #[tokio::test]
    async fn refuses_gently_without_a_previous_result() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        let result = SummarySkill.handle(&context, &mut turn(&mut state, None)).await;
        assert!(result.ok, "missing source is not an error");
        assert!(result.message.contains("没有结果"));
    }

    #[tokio::test]
    async fn empty_previous_result_gets_the_same_friendly_message() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        state.remember_result(Vec::new(), json!({"items": []}));
        let result = SummarySkill.handle(&context, &mut turn(&mut state, None)).await;
        assert!(result.ok);
        assert!(result.message.contains("没有结果"));
    }

    #[tokio::test]
    async fn chained_data_takes_precedence_over_state() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        state.remember_result(
            vec!["stale".to_owned()],
            json!({"items": [{"record_id": "stale", "fields": {"案号": "旧"}}]}),
        );

        let chained = json!({
            "items": [
                {"record_id": "rec1", "fields": {"案号": "A-1", "案由": "合同纠纷"}},
                {"record_id": "rec2", "fields": {"案号": "A-2", "案由": "劳动争议"}}
            ]
        });
        let result = SummarySkill.handle(&context, &mut turn(&mut state, Some(chained))).await;
        assert!(result.message.contains("共 2 条"));
        assert!(result.message.contains("A-1"));
    }

    #[tokio::test]
    async fn llm_summary_is_used_when_available() {
        let mut context = context_with(Arc::new(FakeTools::default()));
        context.chat_llm = Some(Arc::new(CannedLlm("本周共两起案件，以合同纠纷为主。".into())));
        let mut state = ConversationState::default();
        state.remember_result(
            vec!["rec1".to_owned()],
            json!({"items": [{"record_id": "rec1", "fields": {"案号": "A-1"}}]}),
        );

        let result = SummarySkill.handle(&context, &mut turn(&mut state, None)).await;
        assert_eq!(result.message, "本周共两起案件，以合同纠纷为主。");
    }
}
