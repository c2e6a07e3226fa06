use async_trait::async_trait;
use casebook_core::chrono::Timelike;
use rand::seq::SliceRandom;

use crate::timeparse::now_local;

use super::{Skill, SkillContext, SkillResult, Turn};

const SENSITIVE_MARKERS: &[&str] =
    &["能赢吗", "会赢吗", "判多久", "胜诉率", "能胜诉", "法律建议", "怎么判"];

const MORNING_GREETINGS: &[&str] = &[
    "早上好！新的一天，先看看今天的开庭安排？",
    "早安！需要我帮您查一下今天的案件吗？",
];
const AFTERNOON_GREETINGS: &[&str] = &[
    "下午好！有什么需要我帮忙的吗？",
    "下午好，要不要看看本周的案件进展？",
];
const EVENING_GREETINGS: &[&str] = &[
    "晚上好！辛苦了，还有需要处理的案件吗？",
    "晚上好，需要我帮您整理一下明天的安排吗?",
];

/// Greeting pool with time-of-day branching, capability help, a templated
/// decline for case-outcome prediction, and a soft refusal for everything
/// out of scope.
pub struct ChitchatSkill;

#[async_trait]
impl Skill for ChitchatSkill {
    fn name(&self) -> &'static str {
        "chitchat"
    }

    async fn handle(&self, _context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        let text = turn.text.trim();

        if SENSITIVE_MARKERS.iter().any(|marker| text.contains(marker)) {
            return SkillResult::refused(
                "案件结果受很多因素影响，我不能预测判决或给出法律意见。具体问题建议与主办律师当面沟通。",
                "sensitive_declined",
            );
        }

        if text.contains("你好") || text.contains("早上好") || text.contains("下午好")
            || text.contains("晚上好") || text.contains("在吗")
        {
            return SkillResult::ok(greeting());
        }

        if text.contains("你能做什么") || text.contains("帮助") || text.contains("怎么用") {
            return SkillResult::ok(
                "我可以帮您：\n\
                 1. 查案件：试试“我的案件”“今天开庭的案件”“查案号 XXX”\n\
                 2. 记录维护：新建、修改、删除案件（删除需要确认）\n\
                 3. 总结：先查询，再说“总结一下”\n\
                 4. 提醒：例如“明天 9 点提醒我准备开庭材料”",
            );
        }

        if text.contains("谢谢") || text.contains("辛苦") {
            return SkillResult::ok("不客气，随时找我！");
        }

        // Out of scope: soft refusal pointing back to what works.
        SkillResult::ok(
            "这个我可能帮不上忙。我擅长案件查询、记录维护和提醒，试试“我的案件”或“帮助”。",
        )
    }
}

fn greeting() -> String {
    let hour = now_local().hour();
    let pool = if (5..12).contains(&hour) {
        MORNING_GREETINGS
    } else if (12..18).contains(&hour) {
        AFTERNOON_GREETINGS
    } else {
        EVENING_GREETINGS
    };
    pool.choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("你好！有什么可以帮您？")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::session::ConversationState;
    use crate::skills::test_support::{context_with, FakeTools};
    use crate::skills::{Skill, Turn};

    use super::ChitchatSkill;

    fn turn<'a>(text: &'a str, state: &'a mut ConversationState) -> Turn<'a> {
        Turn { open_id: "ou_A", text, state, forced_payload: None, chained_data: None }
    }

    #[tokio::test]
    async fn sensitive_outcome_questions_get_the_templated_decline() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        for text in ["这个案子能赢吗", "大概会判多久", "给点法律建议"] {
            let result = ChitchatSkill.handle(&context, &mut turn(text, &mut state)).await;
            assert_eq!(result.code, Some("sensitive_declined"), "input: {text}");
            assert!(result.message.contains("不能预测"));
        }
    }

    #[tokio::test]
    async fn greetings_come_from_the_pool() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        let result = ChitchatSkill.handle(&context, &mut turn("你好", &mut state)).await;
        assert!(result.ok);
        assert!(!result.message.is_empty());
    }

    #[tokio::test]
    async fn help_lists_capabilities() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        let result = ChitchatSkill.handle(&context, &mut turn("你能做什么", &mut state)).await;
        assert!(result.message.contains("查案件"));
        assert!(result.message.contains("提醒"));
    }

    #[tokio::test]
    async fn out_of_scope_requests_get_a_soft_refusal() {
        let context = context_with(Arc::new(FakeTools::default()));
        let mut state = ConversationState::default();
        let result =
            ChitchatSkill.handle(&context, &mut turn("帮我写一首诗吧", &mut state)).await;
        assert!(result.ok);
        assert!(result.message.contains("帮不上忙"));
    }
}
