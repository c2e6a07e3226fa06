use serde_json::Value;

use crate::domain::record::{ChangeSet, EventKind, FieldMap, FieldValue};
use crate::rules::{Condition, ConditionKind, Rule, Trigger};

/// Why a rule did or did not match; carried into the run log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub reason: String,
}

impl MatchOutcome {
    fn matched() -> Self {
        Self { matched: true, reason: String::new() }
    }

    fn miss(reason: impl Into<String>) -> Self {
        Self { matched: false, reason: reason.into() }
    }
}

/// Evaluates a rule's trigger condition set against `(old, new, changes)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchEngine;

impl MatchEngine {
    pub fn evaluate(
        &self,
        rule: &Rule,
        event_kind: EventKind,
        old: &FieldMap,
        new: &FieldMap,
        changes: &ChangeSet,
    ) -> MatchOutcome {
        if !rule.trigger.on.iter().any(|on| on.matches(event_kind)) {
            return MatchOutcome::miss("event_kind_mismatch");
        }

        // A bare trigger.field with no condition means changed(field).
        if let Some(field) = &rule.trigger.field {
            if rule.trigger.condition.is_none() && changes.get(field).is_none() {
                return MatchOutcome::miss("trigger_field_unchanged");
            }
        }

        if let Some(condition) = &rule.trigger.condition {
            if !self.condition_holds(condition, rule.trigger.field.as_deref(), old, new, changes) {
                return MatchOutcome::miss("condition_miss");
            }
        }

        if let Some(all) = &rule.trigger.all {
            let holds = all.iter().all(|condition| {
                self.condition_holds(condition, rule.trigger.field.as_deref(), old, new, changes)
            });
            if !holds {
                return MatchOutcome::miss("condition_all_miss");
            }
        }

        if let Some(any) = &rule.trigger.any {
            let holds = any.iter().any(|condition| {
                self.condition_holds(condition, rule.trigger.field.as_deref(), old, new, changes)
            });
            if !holds {
                return MatchOutcome::miss("condition_any_miss");
            }
        }

        MatchOutcome::matched()
    }

    fn condition_holds(
        &self,
        condition: &Condition,
        inherited_field: Option<&str>,
        _old: &FieldMap,
        new: &FieldMap,
        changes: &ChangeSet,
    ) -> bool {
        let field = condition.field.as_deref().or(inherited_field);

        match condition.kind {
            ConditionKind::Changed => match field {
                Some(field) => changes.get(field).is_some(),
                None => !changes.is_empty(),
            },
            ConditionKind::Equals => {
                let Some(field) = field else { return false };
                let current = current_value(field, new, changes);
                match (current, &condition.value) {
                    (Some(value), Some(expected)) => value_equals(&value, expected),
                    _ => false,
                }
            }
            ConditionKind::In => {
                let Some(field) = field else { return false };
                let Some(Value::Array(expected)) = &condition.value else { return false };
                match current_value(field, new, changes) {
                    Some(value) => expected.iter().any(|item| value_equals(&value, item)),
                    None => false,
                }
            }
            ConditionKind::Contains => {
                let Some(field) = field else { return false };
                let Some(expected) = condition.value.as_ref().and_then(Value::as_str) else {
                    return false;
                };
                match current_value(field, new, changes) {
                    Some(FieldValue::Text(text)) => text.contains(expected),
                    Some(FieldValue::MultiSelect(values)) => {
                        values.iter().any(|value| value == expected)
                    }
                    Some(other) => other.as_text().contains(expected),
                    None => false,
                }
            }
            ConditionKind::AnyFieldChanged => {
                let excluded = condition.exclude.as_deref().unwrap_or(&[]);
                changes
                    .changes
                    .iter()
                    .any(|change| !excluded.iter().any(|name| name == &change.field))
            }
        }
    }
}

/// The post-change value of a field: the diff's `new` side when the field
/// changed, otherwise the fetched value.
fn current_value(field: &str, new: &FieldMap, changes: &ChangeSet) -> Option<FieldValue> {
    if let Some(change) = changes.get(field) {
        return change.new.clone();
    }
    new.get(field).cloned()
}

/// Compares a typed field value against a plain YAML/JSON expectation.
fn value_equals(value: &FieldValue, expected: &Value) -> bool {
    match (value, expected) {
        (FieldValue::Text(text), Value::String(expected))
        | (FieldValue::SingleSelect(text), Value::String(expected))
        | (FieldValue::Phone(text), Value::String(expected))
        | (FieldValue::Location(text), Value::String(expected)) => text == expected,
        (FieldValue::Number(number), Value::Number(expected)) => {
            expected.as_f64().map(|expected| (number - expected).abs() < f64::EPSILON).unwrap_or(false)
        }
        (FieldValue::DateMs(ms), Value::Number(expected)) => {
            expected.as_i64().map(|expected| *ms == expected).unwrap_or(false)
        }
        (FieldValue::MultiSelect(values), Value::String(expected)) => {
            values.len() == 1 && values[0] == *expected
        }
        (FieldValue::Unknown(raw), expected) => raw == expected,
        _ => false,
    }
}

/// When a rule matched, the single trigger field and its old→new pair to
/// record in the run log (only when the rule names one).
pub fn matched_trigger_change<'a>(
    trigger: &Trigger,
    changes: &'a ChangeSet,
) -> Option<(&'a str, &'a Option<FieldValue>, &'a Option<FieldValue>)> {
    let field = trigger.field.as_deref()?;
    let change = changes.get(field)?;
    Some((change.field.as_str(), &change.old, &change.new))
}
