use std::collections::BTreeMap;

use serde_json::{json, Value};

/// Channel-neutral response produced by the renderer; the formatter turns it
/// into a channel message with automatic text fallback.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedResponse {
    pub text_fallback: String,
    pub blocks: Option<Vec<Block>>,
    pub meta: BTreeMap<String, String>,
}

impl RenderedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text_fallback: text.into(), blocks: None, meta: BTreeMap::new() }
    }

    pub fn with_blocks(text: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self { text_fallback: text.into(), blocks: Some(blocks), meta: BTreeMap::new() }
    }
}

/// The supported card block set. Anything beyond this renders as plain text
/// fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Block {
    Header { title: String },
    Text { content: String },
    Fields { pairs: Vec<(String, String)> },
    /// Two-button confirm/cancel row used by pending-action prompts.
    Confirm { confirm_text: String, cancel_text: String },
}

/// Renders blocks into an interactive card payload.
pub fn render_card(blocks: &[Block]) -> Value {
    let mut header = None;
    let mut elements = Vec::new();

    for block in blocks {
        match block {
            Block::Header { title } => {
                header = Some(json!({
                    "title": {"tag": "plain_text", "content": title}
                }));
            }
            Block::Text { content } => {
                elements.push(json!({
                    "tag": "div",
                    "text": {"tag": "lark_md", "content": content}
                }));
            }
            Block::Fields { pairs } => {
                let fields: Vec<Value> = pairs
                    .iter()
                    .map(|(name, value)| {
                        json!({
                            "is_short": true,
                            "text": {"tag": "lark_md", "content": format!("**{name}**\n{value}")}
                        })
                    })
                    .collect();
                elements.push(json!({"tag": "div", "fields": fields}));
            }
            Block::Confirm { confirm_text, cancel_text } => {
                elements.push(json!({
                    "tag": "action",
                    "actions": [
                        {
                            "tag": "button",
                            "text": {"tag": "plain_text", "content": confirm_text},
                            "type": "primary",
                            "value": {"action": "confirm"}
                        },
                        {
                            "tag": "button",
                            "text": {"tag": "plain_text", "content": cancel_text},
                            "type": "default",
                            "value": {"action": "cancel"}
                        }
                    ]
                }));
            }
        }
    }

    let mut card = json!({
        "config": {"wide_screen_mode": true},
        "elements": elements
    });
    if let Some(header) = header {
        card["header"] = header;
    }
    card
}

/// Parses a card of the supported block set back into blocks. Inverse of
/// `render_card` modulo unspecified optional fields.
pub fn parse_card(card: &Value) -> Option<Vec<Block>> {
    let mut blocks = Vec::new();

    if let Some(title) = card
        .get("header")
        .and_then(|header| header.get("title"))
        .and_then(|title| title.get("content"))
        .and_then(Value::as_str)
    {
        blocks.push(Block::Header { title: title.to_owned() });
    }

    let elements = card.get("elements")?.as_array()?;
    for element in elements {
        match element.get("tag").and_then(Value::as_str)? {
            "div" => {
                if let Some(fields) = element.get("fields").and_then(Value::as_array) {
                    let mut pairs = Vec::with_capacity(fields.len());
                    for field in fields {
                        let content = field
                            .get("text")
                            .and_then(|text| text.get("content"))
                            .and_then(Value::as_str)?;
                        let (name, value) = split_field_content(content)?;
                        pairs.push((name, value));
                    }
                    blocks.push(Block::Fields { pairs });
                } else {
                    let content = element
                        .get("text")
                        .and_then(|text| text.get("content"))
                        .and_then(Value::as_str)?;
                    blocks.push(Block::Text { content: content.to_owned() });
                }
            }
            "action" => {
                let actions = element.get("actions").and_then(Value::as_array)?;
                let mut confirm_text = None;
                let mut cancel_text = None;
                for action in actions {
                    let label = action
                        .get("text")
                        .and_then(|text| text.get("content"))
                        .and_then(Value::as_str)?;
                    match action
                        .get("value")
                        .and_then(|value| value.get("action"))
                        .and_then(Value::as_str)
                    {
                        Some("confirm") => confirm_text = Some(label.to_owned()),
                        Some("cancel") => cancel_text = Some(label.to_owned()),
                        _ => return None,
                    }
                }
                blocks.push(Block::Confirm {
                    confirm_text: confirm_text?,
                    cancel_text: cancel_text?,
                });
            }
            _ => return None,
        }
    }

    Some(blocks)
}

fn split_field_content(content: &str) -> Option<(String, String)> {
    let rest = content.strip_prefix("**")?;
    let (name, value) = rest.split_once("**\n")?;
    Some((name.to_owned(), value.to_owned()))
}

/// Builds the outbound message body: an interactive card when blocks are
/// present, a plain text message otherwise.
pub fn to_message_body(response: &RenderedResponse) -> (&'static str, Value) {
    match &response.blocks {
        Some(blocks) if !blocks.is_empty() => ("interactive", render_card(blocks)),
        _ => ("text", json!({"text": response.text_fallback})),
    }
}
