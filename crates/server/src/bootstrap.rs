use std::sync::Arc;

use casebook_agent::skills::SkillSettings;
use casebook_agent::{HttpLlmClient, HttpToolClient, Orchestrator, ReminderDispatcher};
use casebook_core::config::{AppConfig, ConfigError, LoadOptions};
use casebook_db::{connect_with_settings, migrations, DbPool, ReminderStore};
use casebook_feishu::{FeishuSender, MessageSender, TokenCache};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<Orchestrator>,
    pub sender: Arc<dyn MessageSender>,
    pub reminder_dispatcher: Option<Arc<ReminderDispatcher>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("orchestrator wiring failed: {0}")]
    Orchestrator(#[from] casebook_core::AgentError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting orchestrator bootstrap"
    );
    let config = AppConfig::load(options)?;

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let http = FeishuSender::default_http_client(10);
    let tokens = Arc::new(TokenCache::new(
        http.clone(),
        &config.feishu.domain,
        &config.feishu.app_id,
        config.feishu.app_secret.clone(),
    ));
    let sender: Arc<dyn MessageSender> =
        Arc::new(FeishuSender::new(http, &config.feishu.domain, tokens));

    let reminder_store = Arc::new(ReminderStore::new(db_pool.clone()));
    let settings = SkillSettings {
        default_app_token: config.bitable.default_app_token.clone(),
        default_table_id: config.bitable.default_table_id.clone(),
        table_aliases: config.bitable.table_aliases.clone(),
        ..SkillSettings::default()
    };

    // The tool client is the required data writer; building fails fast when
    // it (or the table configuration it needs) is absent.
    let orchestrator = Orchestrator::builder()
        .tool_client(Arc::new(HttpToolClient::new(&config.server.mcp_server_base, 30)))
        .chat_llm(Arc::new(HttpLlmClient::from_endpoint(&config.llm.chat)))
        .task_llm(Arc::new(HttpLlmClient::from_endpoint(config.llm.task_endpoint())))
        .reminders(reminder_store.clone())
        .settings(settings)
        .build()?;

    let reminder_dispatcher = config
        .reminder
        .scheduler_enabled
        .then(|| Arc::new(ReminderDispatcher::new(reminder_store, sender.clone())));

    Ok(Application {
        config,
        db_pool,
        orchestrator: Arc::new(orchestrator),
        sender,
        reminder_dispatcher,
    })
}
