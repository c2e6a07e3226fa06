//! Rule-driven automation engine over bitable record changes.
//!
//! Change events (or polling compensation) flow through the [`Dispatcher`]
//! into the [`AutomationEngine`], which diffs fetched fields against the
//! snapshot store, matches declarative rules, and executes action pipelines
//! with retry, idempotency, and dead-letter accounting. A [`SchemaWatcher`]
//! tracks field-schema drift and runtime-disables rules whose trigger fields
//! disappear.

pub mod auth;
pub mod dispatcher;
pub mod executors;
pub mod http_guard;
pub mod processor;
pub mod scheduler;
pub mod schema_watcher;
pub mod surface;

pub use auth::{sign_payload, verify_shared_auth, AuthHeaders};
pub use dispatcher::{Dispatcher, EventOutcome};
pub use executors::{ActionContext, ActionRun, ExecutorSet, PipelineOutcome};
pub use http_guard::{HostViolation, OutboundHostGuard};
pub use processor::{
    AutomationEngine, ProcessKind, ProcessOrigin, ProcessReport, RuleEvaluation, ScanCounters,
    ScanReport,
};
pub use scheduler::{
    next_cron_run_ms, spawn_poller, spawn_schema_refresher, CronScheduler, DelayScheduler,
};
pub use schema_watcher::{DisabledRule, RefreshOutcome, SchemaWatcher};
pub use surface::{router as automation_router, serve as serve_automation};
