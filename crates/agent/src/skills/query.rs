use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::info;

use crate::timeparse::{day_range_ms, now_local};
use crate::tool_client::tools;

use super::{resolve_table, Skill, SkillContext, SkillResult, Turn};

fn case_no_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[（(]\d{4}[）)][\u{4e00}-\u{9fff}A-Za-z0-9]*号").expect("case pattern compiles")
    })
}

/// Picks the right search tool from parsed slots: exact case number, person
/// ("my cases"), date range, keyword, or a plain page-through.
pub struct QuerySkill;

#[async_trait]
impl Skill for QuerySkill {
    fn name(&self) -> &'static str {
        "query"
    }

    async fn handle(&self, context: &SkillContext, turn: &mut Turn<'_>) -> SkillResult {
        // L0-forwarded continuations first: pagination and ordinal detail.
        if let Some(payload) = turn.forced_payload.clone() {
            if let Some(record_id) = payload.get("detail_record_id").and_then(Value::as_str) {
                return self.record_detail(context, turn, record_id).await;
            }
            if let Some(pagination) = payload.get("pagination") {
                return self.next_page(context, turn, pagination).await;
            }
        }

        let (app_token, table_id, _confidence) = resolve_table(context, turn.text).await;
        let settings = &context.settings;
        let text = turn.text;

        let (tool, mut params, description) = if let Some(case_no) =
            case_no_pattern().find(text).map(|hit| hit.as_str().to_owned())
        {
            (
                tools::SEARCH_EXACT,
                json!({"field": settings.case_no_field, "value": case_no.clone()}),
                format!("案号 {case_no}"),
            )
        } else if text.contains("我的") {
            (
                tools::SEARCH_PERSON,
                json!({"field": settings.person_field, "open_id": turn.open_id}),
                "我负责的案件".to_owned(),
            )
        } else if let Some((from, to)) = day_range_ms(text, now_local()) {
            (
                tools::SEARCH_DATE_RANGE,
                json!({"field": settings.date_field, "from": from, "to": to}),
                "按日期筛选的案件".to_owned(),
            )
        } else if let Some(keyword) = extract_keyword(text) {
            (
                tools::SEARCH_KEYWORD,
                json!({"field": "案由", "keyword": keyword.clone()}),
                format!("关键词 {keyword}"),
            )
        } else {
            (tools::SEARCH, json!({}), "全部案件".to_owned())
        };

        params["app_token"] = Value::String(app_token);
        params["table_id"] = Value::String(table_id.clone());

        let data = match context.tools.call(tool, params.clone()).await {
            Ok(data) => data,
            Err(error) => {
                info!(
                    event_name = "agent.skill.query_failed",
                    tool,
                    error = %error,
                    "query tool call failed"
                );
                return SkillResult::failed(error.user_message());
            }
        };

        turn.state.active_table = Some(table_id);
        turn.state.last_query_params = Some(json!({"tool": tool, "params": params}));
        self.remember_and_render(turn, &data, &description)
    }
}

impl QuerySkill {
    async fn record_detail(
        &self,
        context: &SkillContext,
        turn: &mut Turn<'_>,
        record_id: &str,
    ) -> SkillResult {
        let params = json!({
            "record_id": record_id,
            "table_id": turn.state.active_table.clone()
                .unwrap_or_else(|| context.settings.default_table_id.clone()),
        });
        match context.tools.call(tools::RECORD_GET, params).await {
            Ok(data) => {
                let lines = record_lines(&data, &["案号", "案由", "审理法院", "开庭日"]);
                turn.state.active_record = Some(record_id.to_owned());
                SkillResult::ok_with_data(
                    format!("已定位该记录：\n{}", lines.join("\n")),
                    json!({"items": [data]}),
                )
            }
            Err(error) => SkillResult::failed(error.user_message()),
        }
    }

    async fn next_page(
        &self,
        context: &SkillContext,
        turn: &mut Turn<'_>,
        pagination: &Value,
    ) -> SkillResult {
        let Some(saved) = pagination.get("params").cloned().filter(|params| !params.is_null())
        else {
            return SkillResult::failed("当前没有可继续分页的查询结果，请先执行一次查询。");
        };
        let tool = saved.get("tool").and_then(Value::as_str).unwrap_or(tools::SEARCH).to_owned();
        let mut params = saved.get("params").cloned().unwrap_or_else(|| json!({}));
        params["page_token"] = pagination.get("page_token").cloned().unwrap_or(Value::Null);

        match context.tools.call(&tool, params).await {
            Ok(data) => self.remember_and_render(turn, &data, "下一页"),
            Err(error) => SkillResult::failed(error.user_message()),
        }
    }

    fn remember_and_render(
        &self,
        turn: &mut Turn<'_>,
        data: &Value,
        description: &str,
    ) -> SkillResult {
        let items = data.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
        let record_ids: Vec<String> = items
            .iter()
            .filter_map(|item| item.get("record_id").and_then(Value::as_str).map(str::to_owned))
            .collect();

        turn.state.next_page_token = data
            .get("page_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_owned);
        turn.state.remember_result(record_ids, data.clone());

        if items.is_empty() {
            return SkillResult::ok_with_data(
                format!("没有找到{description}相关的记录。"),
                data.clone(),
            );
        }

        let mut lines = vec![format!("找到 {} 条{}：", items.len(), description)];
        for (index, item) in items.iter().take(10).enumerate() {
            let summary = record_lines(item, &["案号", "案由"]).join("，");
            lines.push(format!("{}. {}", index + 1, summary));
        }
        if data.get("has_more").and_then(Value::as_bool).unwrap_or(false) {
            lines.push("还有更多结果，回复“下一页”继续查看。".to_owned());
        }

        SkillResult::ok_with_data(lines.join("\n"), data.clone())
    }
}

fn record_lines(item: &Value, fields: &[&str]) -> Vec<String> {
    let empty = json!({});
    let field_map = item.get("fields").unwrap_or(&empty);
    fields
        .iter()
        .filter_map(|name| {
            let value = field_map.get(*name)?;
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (!text.is_empty()).then(|| format!("{name}：{text}"))
        })
        .collect()
}

/// The free-text remainder after stripping query verbs; used for keyword
/// search.
fn extract_keyword(text: &str) -> Option<String> {
    let stripped = text
        .trim()
        .trim_start_matches("查一下")
        .trim_start_matches("查询")
        .trim_start_matches("查")
        .trim_start_matches("找一下")
        .trim_start_matches("找")
        .trim_start_matches("搜索")
        .trim();
    let keyword = stripped
        .trim_end_matches("的案件")
        .trim_end_matches("案件")
        .trim_end_matches("的案子")
        .trim();
    (!keyword.is_empty() && keyword != text.trim()).then(|| keyword.to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::session::ConversationState;
    use crate::skills::test_support::{context_with, FakeTools};
    use crate::skills::{Skill, Turn};

    use super::QuerySkill;

    fn turn<'a>(
        text: &'a str,
        state: &'a mut ConversationState,
        forced: Option<serde_json::Value>,
    ) -> Turn<'a> {
        Turn { open_id: "ou_A", text, state, forced_payload: forced, chained_data: None }
    }

    #[tokio::test]
    async fn my_cases_queries_the_person_field_with_the_caller_id() {
        let tools = Arc::new(FakeTools::default());
        tools
            .seed("rec_mine", json!({"主办律师": [{"id": "ou_A"}], "案号": "A-1", "案由": "合同纠纷"}))
            .await;
        tools.seed("rec_other", json!({"主办律师": [{"id": "ou_B"}], "案号": "B-1"})).await;

        let context = context_with(tools.clone());
        let mut state = ConversationState::default();
        let result = QuerySkill.handle(&context, &mut turn("我的案件", &mut state, None)).await;

        assert!(result.ok);
        assert!(result.message.contains("找到 1 条"));
        assert_eq!(state.last_result_ids, vec!["rec_mine".to_owned()]);

        let calls = tools.calls.lock().await;
        let (tool, params) = &calls[0];
        assert_eq!(tool, "feishu.v1.bitable.search_person");
        assert_eq!(params["open_id"], "ou_A");
        assert_eq!(params["field"], "主办律师");
    }

    #[tokio::test]
    async fn todays_hearings_use_an_epoch_ms_range() {
        let tools = Arc::new(FakeTools::default());
        let context = context_with(tools.clone());
        let mut state = ConversationState::default();
        QuerySkill.handle(&context, &mut turn("今天开庭的案件", &mut state, None)).await;

        let calls = tools.calls.lock().await;
        let (tool, params) = &calls[0];
        assert_eq!(tool, "feishu.v1.bitable.search_date_range");
        assert_eq!(params["field"], "开庭日");
        let from = params["from"].as_i64().expect("from");
        let to = params["to"].as_i64().expect("to");
        assert_eq!(to - from, 86_399_000, "range spans the local day");
    }

    #[tokio::test]
    async fn case_number_mentions_search_exact() {
        let tools = Arc::new(FakeTools::default());
        tools.seed("rec1", json!({"案号": "(2026)沪01民终1号", "案由": "合同纠纷"})).await;
        let context = context_with(tools.clone());
        let mut state = ConversationState::default();

        let result = QuerySkill
            .handle(&context, &mut turn("查 (2026)沪01民终1号", &mut state, None))
            .await;
        assert!(result.ok);

        let calls = tools.calls.lock().await;
        assert_eq!(calls[0].0, "feishu.v1.bitable.search_exact");
        assert_eq!(calls[0].1["value"], "(2026)沪01民终1号");
    }

    #[tokio::test]
    async fn empty_results_are_friendly_and_remembered() {
        let tools = Arc::new(FakeTools::default());
        let context = context_with(tools);
        let mut state = ConversationState::default();

        let result = QuerySkill.handle(&context, &mut turn("我的案件", &mut state, None)).await;
        assert!(result.ok);
        assert!(result.message.contains("没有找到"));
        assert!(state.last_result_ids.is_empty());
        assert!(state.last_result.is_some(), "empty result is still remembered for summary");
    }

    #[tokio::test]
    async fn forced_detail_fetches_and_seeds_active_record() {
        let tools = Arc::new(FakeTools::default());
        tools.seed("rec2", json!({"案号": "B-2", "案由": "劳动争议"})).await;
        let context = context_with(tools);
        let mut state = ConversationState::default();

        let result = QuerySkill
            .handle(
                &context,
                &mut turn("第2个", &mut state, Some(json!({"detail_record_id": "rec2"}))),
            )
            .await;
        assert!(result.ok);
        assert!(result.message.contains("B-2"));
        assert_eq!(state.active_record.as_deref(), Some("rec2"));
    }
}
