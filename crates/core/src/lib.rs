// Re-export chrono for downstream crates that need DateTime types
pub use chrono;

pub mod business;
pub mod config;
pub mod domain;
pub mod errors;
pub mod matching;
pub mod rules;
pub mod template;

pub use business::business_key;
pub use domain::record::{
    AppToken, ChangeSet, EventEnvelope, EventKind, FieldChange, FieldMap, FieldValue, RecordId,
    RecordLocator, TableId, UserId,
};
pub use domain::schema::{FieldDescriptor, SchemaDiff, TableSchema};
pub use errors::{AgentError, AutomationError, ErrorBody, ErrorCode, UpstreamError};
pub use matching::{matched_trigger_change, MatchEngine, MatchOutcome};
pub use rules::{
    trigger_conditions, trigger_fields, Action, ActionTarget, Condition, ConditionKind, Rule,
    RuleLoadError, RuleRegistry, RuleTable, Trigger, TriggerOn, WatchPlan,
};
pub use template::{render, TemplateContext};
