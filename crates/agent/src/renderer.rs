use casebook_core::chrono::Timelike;
use casebook_feishu::RenderedResponse;
use rand::seq::SliceRandom;

use crate::skills::SkillResult;
use crate::timeparse::now_local;

const ACK_VARIANTS: &[&str] = &["好的，", "收到，", "没问题，"];

/// Converts a skill result into the channel-neutral response shape. Mutating
/// acknowledgements get a random opener variant; failures pass through
/// untouched so the friendly error text stays exact.
pub fn render(skill_name: &str, result: &SkillResult) -> RenderedResponse {
    let mut text = result.message.clone();

    if result.ok && matches!(skill_name, "create" | "update" | "delete") && text.starts_with("已")
    {
        let opener = ACK_VARIANTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("");
        text = format!("{opener}{text}");
    }

    let mut response = match &result.blocks {
        Some(blocks) if !blocks.is_empty() => {
            RenderedResponse::with_blocks(text, blocks.clone())
        }
        _ => RenderedResponse::text(text),
    };
    response.meta.insert("skill".to_owned(), skill_name.to_owned());
    if let Some(code) = result.code {
        response.meta.insert("code".to_owned(), code.to_owned());
    }
    response
}

/// Time-of-day label used by greeting templates.
pub fn time_of_day_label() -> &'static str {
    let hour = now_local().hour();
    if (5..12).contains(&hour) {
        "morning"
    } else if (12..18).contains(&hour) {
        "afternoon"
    } else {
        "evening"
    }
}

#[cfg(test)]
mod tests {
    use casebook_feishu::Block;

    use crate::skills::SkillResult;

    use super::{render, time_of_day_label};

    #[test]
    fn failures_keep_their_exact_message() {
        let result = SkillResult::failed("操作没有成功，请稍后重试或换个说法。");
        let response = render("query", &result);
        assert_eq!(response.text_fallback, "操作没有成功，请稍后重试或换个说法。");
        assert!(response.blocks.is_none());
    }

    #[test]
    fn mutating_acks_get_an_opener_variant() {
        let result = SkillResult::ok("已删除该记录。");
        let response = render("delete", &result);
        assert!(response.text_fallback.ends_with("已删除该记录。"));
        assert!(response.text_fallback.len() >= "已删除该记录。".len());
    }

    #[test]
    fn blocks_and_meta_are_carried_through() {
        let mut result = SkillResult::ok("确认删除？");
        result.blocks = Some(vec![Block::Confirm {
            confirm_text: "确认".into(),
            cancel_text: "取消".into(),
        }]);
        result.code = Some("needs_confirm");

        let response = render("delete", &result);
        assert!(response.blocks.is_some());
        assert_eq!(response.meta.get("skill").map(String::as_str), Some("delete"));
        assert_eq!(response.meta.get("code").map(String::as_str), Some("needs_confirm"));
    }

    #[test]
    fn time_label_is_one_of_the_three() {
        assert!(["morning", "afternoon", "evening"].contains(&time_of_day_label()));
    }
}
