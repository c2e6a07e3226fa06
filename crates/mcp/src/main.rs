//! Tool server / automation worker binary.
//!
//! `ROLE=mcp_server` (default) exposes the HTTP tool surface;
//! `ROLE=automation_worker` runs the rule engine with its own HTTP surface,
//! delay scheduler, poller, and schema refresher. Each role listens on its
//! own port.

use std::process::ExitCode;
use std::sync::Arc;

use casebook_automation::{
    spawn_poller, spawn_schema_refresher, CronScheduler, DelayScheduler, Dispatcher,
    OutboundHostGuard, SchemaWatcher,
};
use casebook_core::config::{AppConfig, LoadOptions, Role};
use casebook_core::rules::RuleRegistry;
use casebook_feishu::{BitableClient, FeishuSender, TokenCache};
use casebook_mcp::tools::{build_registry, BitableToolContext, DocSearchTool};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(config_error) => {
            eprintln!("fatal: configuration invalid: {config_error}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Init(message)) => {
            error!(event_name = "system.init.failed", error = %message, "startup failed");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(message)) => {
            error!(event_name = "system.runtime.failed", error = %message, "runtime failure");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Init(String),
    Runtime(String),
}

fn init_tracing(config: &AppConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false);
    match config.logging.format {
        casebook_core::config::LogFormat::Json => builder.json().init(),
        casebook_core::config::LogFormat::Pretty => builder.pretty().init(),
        casebook_core::config::LogFormat::Compact => builder.compact().init(),
    }
}

async fn run(config: AppConfig) -> Result<(), RunError> {
    let pool = casebook_db::connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| RunError::Init(format!("database connection failed: {error}")))?;
    casebook_db::migrations::run_pending(&pool)
        .await
        .map_err(|error| RunError::Init(format!("database migration failed: {error}")))?;

    let http = FeishuSender::default_http_client(10);
    let tokens = Arc::new(TokenCache::new(
        http.clone(),
        &config.feishu.domain,
        &config.feishu.app_id,
        config.feishu.app_secret.clone(),
    ));
    let bitable = Arc::new(BitableClient::new(http.clone(), &config.feishu.domain, tokens.clone()));

    match config.server.role {
        Role::McpServer => {
            info!(event_name = "system.role.mcp_server", "starting tool server");
            let context = Arc::new(BitableToolContext {
                api: bitable,
                default_app_token: config.bitable.default_app_token.clone(),
                default_table_id: config.bitable.default_table_id.clone(),
            });
            let doc = DocSearchTool {
                http,
                domain: config.feishu.domain.clone(),
                tokens,
            };
            let registry = Arc::new(build_registry(context, doc));
            casebook_mcp::serve(&config.server.bind_address, config.server.port, registry)
                .await
                .map_err(|error| RunError::Runtime(error.to_string()))
        }
        Role::AutomationWorker => {
            info!(event_name = "system.role.automation_worker", "starting automation worker");
            let rules = Arc::new(
                RuleRegistry::load_from_path(&config.automation.rules_path)
                    .map_err(|error| RunError::Init(format!("rules file invalid: {error}")))?,
            );

            let executors = casebook_automation::ExecutorSet::new(
                bitable.clone(),
                Arc::new(casebook_db::DelayTaskStore::new(pool.clone())),
                OutboundHostGuard::new(&config.automation.http_allowed_domains),
                config.automation.action_max_retries,
                config.automation.action_retry_delay_secs,
                config.automation.http_timeout_secs,
                config.automation.status_write_enabled,
            );
            let engine = Arc::new(casebook_automation::AutomationEngine::new(
                config.automation.clone(),
                config.bitable.clone(),
                bitable.clone(),
                rules.clone(),
                casebook_db::SnapshotStore::new(pool.clone()),
                casebook_db::IdempotencyStore::new(
                    pool.clone(),
                    config.automation.event_idempotency_ttl_secs,
                ),
                casebook_db::CheckpointStore::new(pool.clone()),
                casebook_db::RunLogStore::new(pool.clone()),
                casebook_db::DeadLetterStore::new(pool.clone()),
                Arc::new(casebook_db::CronStore::new(pool.clone())),
                executors,
            ));
            let schema_watcher = Arc::new(SchemaWatcher::new(
                config.automation.clone(),
                bitable,
                rules,
            ));
            let dispatcher = Arc::new(Dispatcher::new(
                engine.clone(),
                schema_watcher.clone(),
                config.feishu.verification_token.clone(),
                config.feishu.encrypt_key.clone(),
            ));

            Arc::new(DelayScheduler::new(engine.clone())).spawn();
            Arc::new(CronScheduler::new(engine.clone())).spawn();
            spawn_poller(engine.clone());
            spawn_schema_refresher(engine, schema_watcher);

            casebook_automation::serve_automation(
                &config.server.bind_address,
                config.server.port,
                dispatcher,
            )
            .await
            .map_err(|error| RunError::Runtime(error.to_string()))
        }
    }
}
