use std::collections::BTreeSet;

use crate::domain::record::FieldMap;

/// Keys resolved from the processing context rather than record fields.
const BUILTIN_KEYS: &[&str] = &["record_id", "table_id", "app_token", "event_id", "rule_id"];

/// Context available to `{placeholder}` rendering.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext<'a> {
    pub record_id: &'a str,
    pub table_id: &'a str,
    pub app_token: &'a str,
    pub event_id: &'a str,
    pub rule_id: &'a str,
    pub fields: Option<&'a FieldMap>,
}

impl<'a> TemplateContext<'a> {
    fn resolve(&self, key: &str) -> Option<String> {
        match key {
            "record_id" => Some(self.record_id.to_owned()),
            "table_id" => Some(self.table_id.to_owned()),
            "app_token" => Some(self.app_token.to_owned()),
            "event_id" => Some(self.event_id.to_owned()),
            "rule_id" => Some(self.rule_id.to_owned()),
            field => self.fields.and_then(|fields| fields.get(field)).map(|value| value.as_text()),
        }
    }
}

/// Renders `{key}` placeholders against builtins and record fields.
/// Unresolvable placeholders render as the empty string.
pub fn render(template: &str, context: &TemplateContext<'_>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let key = &after_open[..close];
                match context.resolve(key) {
                    Some(value) => output.push_str(&value),
                    None => {}
                }
                rest = &after_open[close + 1..];
            }
            None => {
                output.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// Collects field names referenced by a template, excluding builtin keys.
pub fn placeholder_fields(template: &str, out: &mut BTreeSet<String>) {
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            return;
        };
        let key = after_open[..close].trim();
        if !key.is_empty() && !BUILTIN_KEYS.contains(&key) {
            out.insert(key.to_owned());
        }
        rest = &after_open[close + 1..];
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::domain::record::{FieldMap, FieldValue};

    use super::{placeholder_fields, render, TemplateContext};

    fn context_fixture(fields: &FieldMap) -> TemplateContext<'_> {
        TemplateContext {
            record_id: "recX",
            table_id: "tblCases",
            app_token: "appA",
            event_id: "evt-1",
            rule_id: "R001",
            fields: Some(fields),
        }
    }

    #[test]
    fn renders_builtins_and_record_fields() {
        let mut fields = FieldMap::new();
        fields.insert("案号".to_owned(), FieldValue::Text("(2026)沪01民终1号".to_owned()));

        let rendered = render("案件 {案号} ({record_id}) 命中 {rule_id}", &context_fixture(&fields));
        assert_eq!(rendered, "案件 (2026)沪01民终1号 (recX) 命中 R001");
    }

    #[test]
    fn unknown_placeholders_render_empty() {
        let fields = FieldMap::new();
        assert_eq!(render("值=[{不存在}]", &context_fixture(&fields)), "值=[]");
    }

    #[test]
    fn unterminated_brace_is_left_verbatim() {
        let fields = FieldMap::new();
        assert_eq!(render("open {record_id and done", &context_fixture(&fields)), "open {record_id and done");
    }

    #[test]
    fn placeholder_scan_skips_builtin_keys() {
        let mut out = BTreeSet::new();
        placeholder_fields("{案号} {record_id} {开庭日}", &mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["开庭日", "案号"]);
    }
}
