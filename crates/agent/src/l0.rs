use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::session::{ConversationState, PendingKind};

/// Outcome of the deterministic pre-LLM layer.
#[derive(Clone, Debug, PartialEq)]
pub enum L0Decision {
    /// Reply immediately; nothing else runs.
    Reply(String),
    /// Skip intent parsing and dispatch this skill with the given payload.
    ForceSkill { skill: &'static str, payload: Value },
    /// Not handled; continue to intent parsing.
    PassThrough,
}

const CONFIRM_TOKENS: &[&str] = &["确认", "是", "确定", "确认删除"];
const CANCEL_TOKENS: &[&str] = &["取消", "否", "算了", "不了", "不用了"];
const NEXT_PAGE_TOKENS: &[&str] = &["下一页", "继续", "更多"];
const EMPTY_LIKE: &[&str] = &["...", "。。。", "???", "？？？", ".", "。", "?", "？"];

fn ordinal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"第\s*([一二三四五六七八九十\d]+)\s*[个条]").expect("ordinal pattern compiles")
    })
}

/// Deterministic short-circuits evaluated before intent parsing. The pending
/// action slot is checked first so confirmations never leak into the LLM
/// ladder. Bulk-destructive phrasing is deliberately NOT handled here: it
/// routes to DeleteSkill, which refuses it with the `delete_disabled` code.
pub fn evaluate(state: &mut ConversationState, text: &str) -> L0Decision {
    let trimmed = text.trim();
    let normalized = normalize(trimmed);

    // 1) empty / symbol-only input
    if is_empty_like(trimmed) {
        return L0Decision::Reply(
            "请问有什么可以帮您？您可以说：查所有案件、我的案件、查案号 XXX。".to_owned(),
        );
    }

    // 2) pending continuation: explicit confirm / cancel, implicit cancel on
    //    anything unrelated
    if let Some(pending) = state.pending().cloned() {
        if CONFIRM_TOKENS.contains(&normalized.as_str()) {
            state.clear_pending();
            return L0Decision::ForceSkill {
                skill: pending.owner_skill,
                payload: json!({
                    "resume": "confirm",
                    "kind": pending_kind_tag(pending.kind),
                    "record_id": pending.target_record_id,
                    "table_id": pending.target_table_id,
                    "slots": pending.payload,
                }),
            };
        }
        if CANCEL_TOKENS.contains(&normalized.as_str()) {
            state.clear_pending();
            return L0Decision::Reply(format!("好的，已取消：{}。", pending.summary));
        }
        if pending.kind == PendingKind::CompleteFields {
            // The next message is treated as the missing slot value.
            state.clear_pending();
            return L0Decision::ForceSkill {
                skill: pending.owner_skill,
                payload: json!({
                    "resume": "fill",
                    "kind": pending_kind_tag(pending.kind),
                    "value": trimmed,
                    "slots": pending.payload,
                }),
            };
        }
        // Unrelated input cancels a confirmation implicitly.
        state.clear_pending();
    }

    // 3) pagination against the previous result
    if NEXT_PAGE_TOKENS.contains(&normalized.as_str()) {
        if state.last_result_ids.is_empty() {
            return L0Decision::Reply(
                "当前没有可继续分页的查询结果，请先执行一次查询。".to_owned(),
            );
        }
        let Some(page_token) = state.next_page_token.clone() else {
            return L0Decision::Reply("已经是最后一页了。".to_owned());
        };
        return L0Decision::ForceSkill {
            skill: "query",
            payload: json!({
                "pagination": {
                    "page_token": page_token,
                    "params": state.last_query_params.clone().unwrap_or(Value::Null),
                }
            }),
        };
    }

    // 4) ordinal / demonstrative referents against the previous result
    if let Some(index) = extract_referent_index(trimmed) {
        if state.last_result_ids.is_empty() {
            return L0Decision::Reply("请先执行查询，我才能识别“第几个”记录。".to_owned());
        }
        if index >= state.last_result_ids.len() {
            return L0Decision::Reply(format!(
                "当前只有 {} 条结果，请重新指定序号。",
                state.last_result_ids.len()
            ));
        }
        let record_id = state.last_result_ids[index].clone();
        state.active_record = Some(record_id.clone());
        return L0Decision::ForceSkill {
            skill: "query",
            payload: json!({"detail_record_id": record_id, "ordinal": index + 1}),
        };
    }

    L0Decision::PassThrough
}

fn pending_kind_tag(kind: PendingKind) -> &'static str {
    match kind {
        PendingKind::ConfirmDelete => "confirm_delete",
        PendingKind::ConfirmUpdate => "confirm_update",
        PendingKind::CompleteFields => "complete_fields",
    }
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_matches(|ch: char| "，。！？!?,. ".contains(ch))
        .to_lowercase()
}

fn is_empty_like(text: &str) -> bool {
    if text.is_empty() || EMPTY_LIKE.contains(&text) {
        return true;
    }
    !text.chars().any(|ch| ('\u{4e00}'..='\u{9fff}').contains(&ch) || ch.is_alphanumeric())
}

/// "第N个" (Chinese numerals included), "这个" = first, "那条" = first.
fn extract_referent_index(text: &str) -> Option<usize> {
    if let Some(captures) = ordinal_pattern().captures(text) {
        let token = captures.get(1)?.as_str();
        let number = if token.chars().all(|ch| ch.is_ascii_digit()) {
            token.parse::<usize>().ok()?
        } else {
            chinese_numeral(token)?
        };
        return number.checked_sub(1);
    }
    if text == "这个" || text == "这条" || text == "那条" || text == "那个" {
        return Some(0);
    }
    None
}

fn chinese_numeral(token: &str) -> Option<usize> {
    const DIGITS: &[(&str, usize)] = &[
        ("一", 1),
        ("二", 2),
        ("三", 3),
        ("四", 4),
        ("五", 5),
        ("六", 6),
        ("七", 7),
        ("八", 8),
        ("九", 9),
    ];
    let digit = |ch: &str| DIGITS.iter().find(|(name, _)| *name == ch).map(|(_, n)| *n);

    let chars: Vec<String> = token.chars().map(|ch| ch.to_string()).collect();
    match chars.as_slice() {
        [single] if *single == "十" => Some(10),
        [single] => digit(single),
        [tens, unit] if *tens == "十" => digit(unit).map(|unit| 10 + unit),
        [tens, unit] if *unit == "十" => digit(tens).map(|tens| tens * 10),
        [tens, mid, unit] if *mid == "十" => {
            Some(digit(tens)? * 10 + digit(unit)?)
        }
        _ => None,
    }
}
