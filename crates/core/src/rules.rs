use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::domain::record::{AppToken, EventKind, TableId};
use crate::template::placeholder_fields;

/// A declarative automation rule: trigger conditions plus an action pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub table: RuleTable,
    pub trigger: Trigger,
    pub pipeline: Vec<Action>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(default)]
    pub app_token: Option<String>,
    pub table_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub on: Vec<TriggerOn>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub all: Option<Vec<Condition>>,
    #[serde(default)]
    pub any: Option<Vec<Condition>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOn {
    Created,
    Updated,
}

impl TriggerOn {
    pub fn matches(&self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (Self::Created, EventKind::Created) | (Self::Updated, EventKind::Updated)
        )
    }
}

/// One trigger predicate. `field` may come from the condition itself or be
/// inherited from the trigger's top-level `field`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub field: Option<String>,
    pub kind: ConditionKind,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Changed,
    Equals,
    In,
    Contains,
    AnyFieldChanged,
}

/// Table an action writes to; `app_token` falls back to the source app.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionTarget {
    #[serde(default)]
    pub app_token: Option<String>,
    pub table_id: String,
}

/// One pipeline step, tagged by action type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "log.write")]
    LogWrite { template: String },
    #[serde(rename = "bitable.update")]
    BitableUpdate { target: ActionTarget, fields: BTreeMap<String, String> },
    #[serde(rename = "bitable.upsert")]
    BitableUpsert {
        target: ActionTarget,
        anchor_field: String,
        fields: BTreeMap<String, String>,
    },
    #[serde(rename = "calendar.create")]
    CalendarCreate { title: String, start_field: String, end_field: String },
    #[serde(rename = "http.request")]
    HttpRequest {
        #[serde(default = "default_post")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
    #[serde(rename = "delay")]
    Delay { seconds: u64, pipeline: Vec<Action> },
}

fn default_true() -> bool {
    true
}

fn default_post() -> String {
    "POST".to_owned()
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::LogWrite { .. } => "log.write",
            Self::BitableUpdate { .. } => "bitable.update",
            Self::BitableUpsert { .. } => "bitable.upsert",
            Self::CalendarCreate { .. } => "calendar.create",
            Self::HttpRequest { .. } => "http.request",
            Self::Delay { .. } => "delay",
        }
    }

    /// Field names referenced by this action's templates, recursing into
    /// delayed sub-pipelines.
    fn referenced_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::LogWrite { template } => placeholder_fields(template, out),
            Self::BitableUpdate { fields, .. } | Self::BitableUpsert { fields, .. } => {
                for template in fields.values() {
                    placeholder_fields(template, out);
                }
            }
            Self::CalendarCreate { title, start_field, end_field } => {
                placeholder_fields(title, out);
                out.insert(start_field.clone());
                out.insert(end_field.clone());
            }
            Self::HttpRequest { body, .. } => {
                if let Some(body) = body {
                    placeholder_fields(&body.to_string(), out);
                }
            }
            Self::Delay { pipeline, .. } => {
                for action in pipeline {
                    action.referenced_fields(out);
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("could not read rules file `{path}`: {source}")]
    ReadFile { path: String, source: std::io::Error },
    #[error("could not parse rules file `{path}`: {source}")]
    ParseFile { path: String, source: serde_yaml::Error },
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<serde_yaml::Value>,
}

/// Which fields the processor needs to fetch for a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchPlan {
    /// At least one rule uses `any_field_changed`; fetch everything.
    AllFields,
    Fields(BTreeSet<String>),
}

impl WatchPlan {
    pub fn field_names(&self) -> Option<Vec<String>> {
        match self {
            Self::AllFields => None,
            Self::Fields(fields) => Some(fields.iter().cloned().collect()),
        }
    }
}

/// Loaded rules indexed by table, with runtime enable/disable overrides that
/// never touch the rules file itself.
pub struct RuleRegistry {
    rules: RwLock<Vec<Rule>>,
    runtime_disabled: RwLock<HashMap<String, String>>,
}

impl RuleRegistry {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules: RwLock::new(rules), runtime_disabled: RwLock::new(HashMap::new()) }
    }

    /// Loads the YAML rules file. Invalid entries are skipped with a warning
    /// so one malformed rule cannot take down the whole engine.
    pub fn load_from_path(path: &Path) -> Result<Self, RuleLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuleLoadError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(parse_rules(&raw, &path.display().to_string())?))
    }

    pub fn from_yaml(raw: &str) -> Result<Self, RuleLoadError> {
        Ok(Self::new(parse_rules(raw, "<inline>")?))
    }

    /// Atomically replaces the rule set (hot reload). Runtime-disable state
    /// is kept for rule ids that survive the reload.
    pub fn replace(&self, rules: Vec<Rule>) {
        let ids: HashSet<String> = rules.iter().map(|rule| rule.id.clone()).collect();
        let mut guard = self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = rules;
        drop(guard);
        let mut disabled =
            self.runtime_disabled.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        disabled.retain(|rule_id, _| ids.contains(rule_id));
    }

    pub fn all(&self) -> Vec<Rule> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Enabled rules for a table, excluding runtime-disabled ones. Rules with
    /// an explicit `app_token` only match that app.
    pub fn enabled_for_table(&self, app_token: &AppToken, table_id: &TableId) -> Vec<Rule> {
        let disabled =
            self.runtime_disabled.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|rule| {
                rule.enabled
                    && rule.table.table_id == table_id.0
                    && rule
                        .table
                        .app_token
                        .as_ref()
                        .map(|token| token == &app_token.0)
                        .unwrap_or(true)
                    && !disabled.contains_key(&rule.id)
            })
            .cloned()
            .collect()
    }

    pub fn find_enabled(&self, rule_id: &str) -> Option<Rule> {
        let disabled =
            self.runtime_disabled.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if disabled.contains_key(rule_id) {
            return None;
        }
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|rule| rule.enabled && rule.id == rule_id)
            .cloned()
    }

    /// Tables that have at least one enabled rule; used as poll targets.
    pub fn rule_tables(&self) -> Vec<(Option<String>, String)> {
        let mut seen = BTreeSet::new();
        let mut tables = Vec::new();
        for rule in self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner()).iter() {
            if !rule.enabled {
                continue;
            }
            let key = (rule.table.app_token.clone(), rule.table.table_id.clone());
            if seen.insert(key.clone()) {
                tables.push(key);
            }
        }
        tables
    }

    /// Disables a rule at runtime (schema drift); the rules file is untouched.
    pub fn runtime_disable(&self, rule_id: &str, reason: impl Into<String>) {
        self.runtime_disabled
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(rule_id.to_owned(), reason.into());
    }

    /// Lifts a runtime disable (the trigger field reappeared).
    pub fn runtime_enable(&self, rule_id: &str) {
        self.runtime_disabled
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(rule_id);
    }

    pub fn runtime_disabled_rules(&self) -> Vec<(String, String)> {
        self.runtime_disabled
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, reason)| (id.clone(), reason.clone()))
            .collect()
    }

    pub fn is_runtime_disabled(&self, rule_id: &str) -> bool {
        self.runtime_disabled
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(rule_id)
    }

    /// Minimal field set the processor must fetch for a table: trigger fields,
    /// template placeholders, and calendar date fields of every enabled rule.
    pub fn watch_plan(&self, app_token: &AppToken, table_id: &TableId) -> WatchPlan {
        let mut fields = BTreeSet::new();
        for rule in self.enabled_for_table(app_token, table_id) {
            if uses_any_field_changed(&rule.trigger) {
                return WatchPlan::AllFields;
            }
            if let Some(field) = &rule.trigger.field {
                fields.insert(field.clone());
            }
            for condition in trigger_conditions(&rule.trigger) {
                if let Some(field) = &condition.field {
                    fields.insert(field.clone());
                }
            }
            for action in &rule.pipeline {
                action.referenced_fields(&mut fields);
            }
        }
        WatchPlan::Fields(fields)
    }
}

fn parse_rules(raw: &str, origin: &str) -> Result<Vec<Rule>, RuleLoadError> {
    let file: RulesFile = serde_yaml::from_str(raw).map_err(|source| {
        RuleLoadError::ParseFile { path: origin.to_owned(), source }
    })?;

    let mut rules = Vec::with_capacity(file.rules.len());
    for (index, raw_rule) in file.rules.into_iter().enumerate() {
        match serde_yaml::from_value::<Rule>(raw_rule) {
            Ok(rule) if rule_is_valid(&rule) => rules.push(rule),
            Ok(rule) => {
                warn!(
                    event_name = "automation.rules.invalid_rule",
                    rule_id = %rule.id,
                    rule_index = index,
                    "rule has no matchable trigger or empty pipeline, skipping"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "automation.rules.invalid_rule",
                    rule_index = index,
                    error = %error,
                    "rule failed to parse, skipping"
                );
            }
        }
    }
    Ok(rules)
}

/// A rule must resolve to at least one matchable predicate and at least one
/// action.
fn rule_is_valid(rule: &Rule) -> bool {
    if rule.id.trim().is_empty() || rule.table.table_id.trim().is_empty() {
        return false;
    }
    if rule.trigger.on.is_empty() || rule.pipeline.is_empty() {
        return false;
    }
    rule.trigger.field.is_some()
        || rule.trigger.condition.is_some()
        || rule.trigger.all.as_ref().map(|all| !all.is_empty()).unwrap_or(false)
        || rule.trigger.any.as_ref().map(|any| !any.is_empty()).unwrap_or(false)
}

pub fn trigger_conditions(trigger: &Trigger) -> Vec<&Condition> {
    let mut conditions = Vec::new();
    if let Some(condition) = &trigger.condition {
        conditions.push(condition);
    }
    if let Some(all) = &trigger.all {
        conditions.extend(all.iter());
    }
    if let Some(any) = &trigger.any {
        conditions.extend(any.iter());
    }
    conditions
}

fn uses_any_field_changed(trigger: &Trigger) -> bool {
    trigger_conditions(trigger)
        .iter()
        .any(|condition| condition.kind == ConditionKind::AnyFieldChanged)
}

/// The trigger field a rule depends on for schema-drift purposes: the
/// explicit `trigger.field` plus any condition fields.
pub fn trigger_fields(rule: &Rule) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    if let Some(field) = &rule.trigger.field {
        fields.insert(field.clone());
    }
    for condition in trigger_conditions(&rule.trigger) {
        if let Some(field) = &condition.field {
            fields.insert(field.clone());
        }
    }
    fields
}
