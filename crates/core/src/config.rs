use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub feishu: FeishuConfig,
    pub bitable: BitableConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub automation: AutomationConfig,
    pub reminder: ReminderConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: SecretString,
    pub verification_token: SecretString,
    pub encrypt_key: Option<SecretString>,
    pub domain: String,
}

#[derive(Clone, Debug)]
pub struct BitableConfig {
    pub default_app_token: String,
    pub default_table_id: String,
    pub default_view_id: Option<String>,
    pub table_aliases: Vec<TableAlias>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableAlias {
    pub table_id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Dual-model routing: `chat` answers conversational turns, `task` handles
/// structured extraction/classification. `task` falls back to `chat` when
/// unset.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub chat: LlmEndpoint,
    pub task: Option<LlmEndpoint>,
}

impl LlmConfig {
    pub fn task_endpoint(&self) -> &LlmEndpoint {
        self.task.as_ref().unwrap_or(&self.chat)
    }
}

#[derive(Clone, Debug)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    McpServer,
    AutomationWorker,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub role: Role,
    pub bind_address: String,
    pub port: u16,
    pub mcp_server_base: String,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub poller_enabled: bool,
    pub poller_interval_secs: u64,
    pub status_write_enabled: bool,
    pub trigger_on_new_record_event: bool,
    pub trigger_on_new_record_scan: bool,
    pub trigger_on_new_record_scan_requires_checkpoint: bool,
    pub new_record_scan_max_trigger_per_run: u32,
    pub schema_sync_enabled: bool,
    pub schema_sync_event_driven: bool,
    pub schema_sync_interval_secs: u64,
    pub schema_webhook_url: Option<String>,
    pub schema_webhook_secret: Option<SecretString>,
    pub schema_webhook_drill_enabled: bool,
    pub action_max_retries: u32,
    pub action_retry_delay_secs: u64,
    pub sync_deletions_enabled: bool,
    pub sync_deletions_max_per_run: u32,
    pub http_allowed_domains: Vec<String>,
    pub http_timeout_secs: u64,
    pub webhook_api_key: Option<SecretString>,
    pub webhook_signature_secret: Option<SecretString>,
    pub webhook_timestamp_tolerance_secs: u64,
    pub scan_page_size: u32,
    pub max_scan_pages: u32,
    pub event_idempotency_ttl_secs: u64,
    pub cron_enabled: bool,
    pub cron_interval_secs: u64,
    pub cron_max_consecutive_failures: u32,
    pub rules_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ReminderConfig {
    pub scheduler_enabled: bool,
    pub dispatch_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub role: Option<Role>,
    pub log_level: Option<String>,
    pub rules_path: Option<PathBuf>,
    pub feishu_app_id: Option<String>,
    pub feishu_app_secret: Option<String>,
    pub feishu_verification_token: Option<String>,
    pub automation_enabled: Option<bool>,
    pub mcp_server_base: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://casebook.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            feishu: FeishuConfig {
                app_id: String::new(),
                app_secret: String::new().into(),
                verification_token: String::new().into(),
                encrypt_key: None,
                domain: "https://open.feishu.cn".to_string(),
            },
            bitable: BitableConfig {
                default_app_token: String::new(),
                default_table_id: String::new(),
                default_view_id: None,
                table_aliases: Vec::new(),
            },
            llm: LlmConfig {
                chat: LlmEndpoint {
                    base_url: "http://localhost:11434".to_string(),
                    api_key: None,
                    model: "qwen2.5".to_string(),
                    timeout_secs: 10,
                    max_retries: 1,
                },
                task: None,
            },
            server: ServerConfig {
                role: Role::McpServer,
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                mcp_server_base: "http://127.0.0.1:8080".to_string(),
                graceful_shutdown_secs: 15,
            },
            automation: AutomationConfig {
                enabled: false,
                poller_enabled: false,
                poller_interval_secs: 300,
                status_write_enabled: false,
                trigger_on_new_record_event: false,
                trigger_on_new_record_scan: false,
                trigger_on_new_record_scan_requires_checkpoint: true,
                new_record_scan_max_trigger_per_run: 20,
                schema_sync_enabled: true,
                schema_sync_event_driven: true,
                schema_sync_interval_secs: 900,
                schema_webhook_url: None,
                schema_webhook_secret: None,
                schema_webhook_drill_enabled: false,
                action_max_retries: 3,
                action_retry_delay_secs: 1,
                sync_deletions_enabled: false,
                sync_deletions_max_per_run: 50,
                http_allowed_domains: Vec::new(),
                http_timeout_secs: 10,
                webhook_api_key: None,
                webhook_signature_secret: None,
                webhook_timestamp_tolerance_secs: 300,
                scan_page_size: 100,
                max_scan_pages: 20,
                event_idempotency_ttl_secs: 24 * 3600,
                cron_enabled: false,
                cron_interval_secs: 30,
                cron_max_consecutive_failures: 3,
                rules_path: PathBuf::from("automation_rules.yaml"),
            },
            reminder: ReminderConfig { scheduler_enabled: false, dispatch_interval_secs: 30 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for Role {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mcp_server" => Ok(Self::McpServer),
            "automation_worker" => Ok(Self::AutomationWorker),
            other => Err(ConfigError::Validation(format!(
                "unsupported role `{other}` (expected mcp_server|automation_worker)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("casebook.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(feishu) = patch.feishu {
            if let Some(app_id) = feishu.app_id {
                self.feishu.app_id = app_id;
            }
            if let Some(app_secret_value) = feishu.app_secret {
                self.feishu.app_secret = secret_value(app_secret_value);
            }
            if let Some(token_value) = feishu.verification_token {
                self.feishu.verification_token = secret_value(token_value);
            }
            if let Some(encrypt_key_value) = feishu.encrypt_key {
                self.feishu.encrypt_key = Some(secret_value(encrypt_key_value));
            }
            if let Some(domain) = feishu.domain {
                self.feishu.domain = domain;
            }
        }

        if let Some(bitable) = patch.bitable {
            if let Some(app_token) = bitable.app_token {
                self.bitable.default_app_token = app_token;
            }
            if let Some(table_id) = bitable.table_id {
                self.bitable.default_table_id = table_id;
            }
            if let Some(view_id) = bitable.view_id {
                self.bitable.default_view_id = Some(view_id);
            }
            if let Some(aliases) = bitable.table_aliases {
                self.bitable.table_aliases = aliases;
            }
        }

        if let Some(llm) = patch.llm {
            apply_llm_patch(&mut self.llm.chat, llm);
        }
        if let Some(task) = patch.task_llm {
            let mut endpoint = self.llm.task.take().unwrap_or_else(|| self.llm.chat.clone());
            apply_llm_patch(&mut endpoint, task);
            self.llm.task = Some(endpoint);
        }

        if let Some(server) = patch.server {
            if let Some(role) = server.role {
                self.server.role = role;
            }
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(mcp_server_base) = server.mcp_server_base {
                self.server.mcp_server_base = mcp_server_base;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(automation) = patch.automation {
            apply_automation_patch(&mut self.automation, automation);
        }

        if let Some(reminder) = patch.reminder {
            if let Some(enabled) = reminder.scheduler_enabled {
                self.reminder.scheduler_enabled = enabled;
            }
            if let Some(interval) = reminder.dispatch_interval_secs {
                self.reminder.dispatch_interval_secs = interval;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CASEBOOK_DATABASE_URL") {
            self.database.url = value;
        }

        if let Some(value) = read_env("FEISHU_APP_ID") {
            self.feishu.app_id = value;
        }
        if let Some(value) = read_env("FEISHU_APP_SECRET") {
            self.feishu.app_secret = secret_value(value);
        }
        if let Some(value) = read_env("FEISHU_VERIFICATION_TOKEN") {
            self.feishu.verification_token = secret_value(value);
        }
        if let Some(value) = read_env("FEISHU_ENCRYPT_KEY") {
            self.feishu.encrypt_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("FEISHU_DOMAIN") {
            self.feishu.domain = value;
        }

        if let Some(value) = read_env("BITABLE_APP_TOKEN") {
            self.bitable.default_app_token = value;
        }
        if let Some(value) = read_env("BITABLE_TABLE_ID") {
            self.bitable.default_table_id = value;
        }
        if let Some(value) = read_env("BITABLE_VIEW_ID") {
            self.bitable.default_view_id = Some(value);
        }

        if let Some(value) = read_env("LLM_BASE_URL") {
            self.llm.chat.base_url = value;
        }
        if let Some(value) = read_env("LLM_API_KEY") {
            self.llm.chat.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LLM_MODEL") {
            self.llm.chat.model = value;
        }
        if let Some(value) = read_env("LLM_TIMEOUT_SECS") {
            self.llm.chat.timeout_secs = parse_u64("LLM_TIMEOUT_SECS", &value)?;
        }

        let task_vars =
            ["TASK_LLM_BASE_URL", "TASK_LLM_API_KEY", "TASK_LLM_MODEL", "TASK_LLM_TIMEOUT_SECS"];
        if task_vars.iter().any(|var| read_env(var).is_some()) {
            let mut endpoint = self.llm.task.take().unwrap_or_else(|| self.llm.chat.clone());
            if let Some(value) = read_env("TASK_LLM_BASE_URL") {
                endpoint.base_url = value;
            }
            if let Some(value) = read_env("TASK_LLM_API_KEY") {
                endpoint.api_key = Some(secret_value(value));
            }
            if let Some(value) = read_env("TASK_LLM_MODEL") {
                endpoint.model = value;
            }
            if let Some(value) = read_env("TASK_LLM_TIMEOUT_SECS") {
                endpoint.timeout_secs = parse_u64("TASK_LLM_TIMEOUT_SECS", &value)?;
            }
            self.llm.task = Some(endpoint);
        }

        if let Some(value) = read_env("ROLE") {
            self.server.role = value.parse()?;
        }
        if let Some(value) = read_env("CASEBOOK_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CASEBOOK_PORT") {
            self.server.port = parse_u16("CASEBOOK_PORT", &value)?;
        }
        if let Some(value) = read_env("MCP_SERVER_BASE") {
            self.server.mcp_server_base = value;
        }

        self.apply_automation_env()?;

        if let Some(value) = read_env("REMINDER_SCHEDULER_ENABLED") {
            self.reminder.scheduler_enabled = parse_bool("REMINDER_SCHEDULER_ENABLED", &value)?;
        }

        let log_level =
            read_env("CASEBOOK_LOGGING_LEVEL").or_else(|| read_env("CASEBOOK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CASEBOOK_LOGGING_FORMAT").or_else(|| read_env("CASEBOOK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_automation_env(&mut self) -> Result<(), ConfigError> {
        let automation = &mut self.automation;
        if let Some(value) = read_env("AUTOMATION_ENABLED") {
            automation.enabled = parse_bool("AUTOMATION_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_POLLER_ENABLED") {
            automation.poller_enabled = parse_bool("AUTOMATION_POLLER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_POLLER_INTERVAL_SECONDS") {
            automation.poller_interval_secs =
                parse_u64("AUTOMATION_POLLER_INTERVAL_SECONDS", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_STATUS_WRITE_ENABLED") {
            automation.status_write_enabled =
                parse_bool("AUTOMATION_STATUS_WRITE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_TRIGGER_ON_NEW_RECORD_EVENT") {
            automation.trigger_on_new_record_event =
                parse_bool("AUTOMATION_TRIGGER_ON_NEW_RECORD_EVENT", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_TRIGGER_ON_NEW_RECORD_SCAN") {
            automation.trigger_on_new_record_scan =
                parse_bool("AUTOMATION_TRIGGER_ON_NEW_RECORD_SCAN", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_TRIGGER_ON_NEW_RECORD_SCAN_REQUIRES_CHECKPOINT") {
            automation.trigger_on_new_record_scan_requires_checkpoint =
                parse_bool("AUTOMATION_TRIGGER_ON_NEW_RECORD_SCAN_REQUIRES_CHECKPOINT", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_NEW_RECORD_SCAN_MAX_TRIGGER_PER_RUN") {
            automation.new_record_scan_max_trigger_per_run =
                parse_u32("AUTOMATION_NEW_RECORD_SCAN_MAX_TRIGGER_PER_RUN", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SCHEMA_SYNC_ENABLED") {
            automation.schema_sync_enabled = parse_bool("AUTOMATION_SCHEMA_SYNC_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SCHEMA_SYNC_EVENT_DRIVEN") {
            automation.schema_sync_event_driven =
                parse_bool("AUTOMATION_SCHEMA_SYNC_EVENT_DRIVEN", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SCHEMA_SYNC_INTERVAL_SECONDS") {
            automation.schema_sync_interval_secs =
                parse_u64("AUTOMATION_SCHEMA_SYNC_INTERVAL_SECONDS", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SCHEMA_WEBHOOK_URL") {
            automation.schema_webhook_url = Some(value);
        }
        if let Some(value) = read_env("AUTOMATION_SCHEMA_WEBHOOK_SECRET") {
            automation.schema_webhook_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("AUTOMATION_SCHEMA_WEBHOOK_DRILL") {
            automation.schema_webhook_drill_enabled =
                parse_bool("AUTOMATION_SCHEMA_WEBHOOK_DRILL", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_ACTION_MAX_RETRIES") {
            automation.action_max_retries = parse_u32("AUTOMATION_ACTION_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_ACTION_RETRY_DELAY_SECONDS") {
            automation.action_retry_delay_secs =
                parse_u64("AUTOMATION_ACTION_RETRY_DELAY_SECONDS", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SYNC_DELETIONS_ENABLED") {
            automation.sync_deletions_enabled =
                parse_bool("AUTOMATION_SYNC_DELETIONS_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SYNC_DELETIONS_MAX_PER_RUN") {
            automation.sync_deletions_max_per_run =
                parse_u32("AUTOMATION_SYNC_DELETIONS_MAX_PER_RUN", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_HTTP_ALLOWED_DOMAINS") {
            automation.http_allowed_domains = value
                .split(',')
                .map(|domain| domain.trim().to_ascii_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect();
        }
        if let Some(value) = read_env("AUTOMATION_HTTP_TIMEOUT_SECONDS") {
            automation.http_timeout_secs = parse_u64("AUTOMATION_HTTP_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_WEBHOOK_API_KEY") {
            automation.webhook_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("AUTOMATION_WEBHOOK_SIGNATURE_SECRET") {
            automation.webhook_signature_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("AUTOMATION_WEBHOOK_TIMESTAMP_TOLERANCE_SECONDS") {
            automation.webhook_timestamp_tolerance_secs =
                parse_u64("AUTOMATION_WEBHOOK_TIMESTAMP_TOLERANCE_SECONDS", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_SCAN_PAGE_SIZE") {
            automation.scan_page_size = parse_u32("AUTOMATION_SCAN_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_MAX_SCAN_PAGES") {
            automation.max_scan_pages = parse_u32("AUTOMATION_MAX_SCAN_PAGES", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_CRON_ENABLED") {
            automation.cron_enabled = parse_bool("AUTOMATION_CRON_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_CRON_INTERVAL_SECONDS") {
            automation.cron_interval_secs =
                parse_u64("AUTOMATION_CRON_INTERVAL_SECONDS", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_CRON_MAX_CONSECUTIVE_FAILURES") {
            automation.cron_max_consecutive_failures =
                parse_u32("AUTOMATION_CRON_MAX_CONSECUTIVE_FAILURES", &value)?;
        }
        if let Some(value) = read_env("AUTOMATION_RULES_PATH") {
            automation.rules_path = PathBuf::from(value);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(role) = overrides.role {
            self.server.role = role;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(rules_path) = overrides.rules_path {
            self.automation.rules_path = rules_path;
        }
        if let Some(app_id) = overrides.feishu_app_id {
            self.feishu.app_id = app_id;
        }
        if let Some(app_secret) = overrides.feishu_app_secret {
            self.feishu.app_secret = secret_value(app_secret);
        }
        if let Some(token) = overrides.feishu_verification_token {
            self.feishu.verification_token = secret_value(token);
        }
        if let Some(enabled) = overrides.automation_enabled {
            self.automation.enabled = enabled;
        }
        if let Some(base) = overrides.mcp_server_base {
            self.server.mcp_server_base = base;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_feishu(&self.feishu)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_automation(&self.automation)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn apply_llm_patch(endpoint: &mut LlmEndpoint, patch: LlmPatch) {
    if let Some(base_url) = patch.base_url {
        endpoint.base_url = base_url;
    }
    if let Some(api_key_value) = patch.api_key {
        endpoint.api_key = Some(secret_value(api_key_value));
    }
    if let Some(model) = patch.model {
        endpoint.model = model;
    }
    if let Some(timeout_secs) = patch.timeout_secs {
        endpoint.timeout_secs = timeout_secs;
    }
    if let Some(max_retries) = patch.max_retries {
        endpoint.max_retries = max_retries;
    }
}

fn apply_automation_patch(automation: &mut AutomationConfig, patch: AutomationPatch) {
    if let Some(enabled) = patch.enabled {
        automation.enabled = enabled;
    }
    if let Some(poller_enabled) = patch.poller_enabled {
        automation.poller_enabled = poller_enabled;
    }
    if let Some(interval) = patch.poller_interval_secs {
        automation.poller_interval_secs = interval;
    }
    if let Some(enabled) = patch.trigger_on_new_record_event {
        automation.trigger_on_new_record_event = enabled;
    }
    if let Some(enabled) = patch.trigger_on_new_record_scan {
        automation.trigger_on_new_record_scan = enabled;
    }
    if let Some(max_retries) = patch.action_max_retries {
        automation.action_max_retries = max_retries;
    }
    if let Some(delay) = patch.action_retry_delay_secs {
        automation.action_retry_delay_secs = delay;
    }
    if let Some(domains) = patch.http_allowed_domains {
        automation.http_allowed_domains = domains;
    }
    if let Some(rules_path) = patch.rules_path {
        automation.rules_path = PathBuf::from(rules_path);
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("casebook.toml"), PathBuf::from("config/casebook.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_feishu(feishu: &FeishuConfig) -> Result<(), ConfigError> {
    if feishu.app_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "feishu.app_id is required. Get it from the developer console > Credentials"
                .to_string(),
        ));
    }
    if !feishu.app_id.starts_with("cli_") {
        return Err(ConfigError::Validation("feishu.app_id must start with `cli_`".to_string()));
    }
    if feishu.app_secret.expose_secret().is_empty() {
        return Err(ConfigError::Validation("feishu.app_secret is required".to_string()));
    }
    if !feishu.domain.starts_with("http://") && !feishu.domain.starts_with("https://") {
        return Err(ConfigError::Validation(
            "feishu.domain must start with http:// or https://".to_string(),
        ));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    for endpoint in std::iter::once(&llm.chat).chain(llm.task.as_ref()) {
        if endpoint.timeout_secs == 0 || endpoint.timeout_secs > 300 {
            return Err(ConfigError::Validation(
                "llm.timeout_secs must be in range 1..=300".to_string(),
            ));
        }
        if endpoint.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("llm.base_url is required".to_string()));
        }
        if endpoint.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model is required".to_string()));
        }
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }
    if !server.mcp_server_base.starts_with("http://")
        && !server.mcp_server_base.starts_with("https://")
    {
        return Err(ConfigError::Validation(
            "server.mcp_server_base must start with http:// or https://".to_string(),
        ));
    }
    Ok(())
}

fn validate_automation(automation: &AutomationConfig) -> Result<(), ConfigError> {
    if automation.http_timeout_secs == 0 || automation.http_timeout_secs > 10 {
        return Err(ConfigError::Validation(
            "automation.http_timeout_secs must be in range 1..=10".to_string(),
        ));
    }
    if automation.action_max_retries == 0 || automation.action_max_retries > 10 {
        return Err(ConfigError::Validation(
            "automation.action_max_retries must be in range 1..=10".to_string(),
        ));
    }
    if automation.webhook_timestamp_tolerance_secs == 0 {
        return Err(ConfigError::Validation(
            "automation.webhook_timestamp_tolerance_secs must be greater than zero".to_string(),
        ));
    }
    if automation.scan_page_size == 0 || automation.scan_page_size > 500 {
        return Err(ConfigError::Validation(
            "automation.scan_page_size must be in range 1..=500".to_string(),
        ));
    }
    if let Some(url) = &automation.schema_webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "automation.schema_webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => {
            Err(ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    feishu: Option<FeishuPatch>,
    bitable: Option<BitablePatch>,
    llm: Option<LlmPatch>,
    task_llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    automation: Option<AutomationPatch>,
    reminder: Option<ReminderPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FeishuPatch {
    app_id: Option<String>,
    app_secret: Option<String>,
    verification_token: Option<String>,
    encrypt_key: Option<String>,
    domain: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BitablePatch {
    app_token: Option<String>,
    table_id: Option<String>,
    view_id: Option<String>,
    table_aliases: Option<Vec<TableAlias>>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    role: Option<Role>,
    bind_address: Option<String>,
    port: Option<u16>,
    mcp_server_base: Option<String>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AutomationPatch {
    enabled: Option<bool>,
    poller_enabled: Option<bool>,
    poller_interval_secs: Option<u64>,
    trigger_on_new_record_event: Option<bool>,
    trigger_on_new_record_scan: Option<bool>,
    action_max_retries: Option<u32>,
    action_retry_delay_secs: Option<u64>,
    http_allowed_domains: Option<Vec<String>>,
    rules_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReminderPatch {
    scheduler_enabled: Option<bool>,
    dispatch_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, Role};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn base_env() {
        env::set_var("FEISHU_APP_ID", "cli_test");
        env::set_var("FEISHU_APP_SECRET", "secret");
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_FEISHU_APP_SECRET", "interp-secret");
        base_env();

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("casebook.toml");
            fs::write(
                &path,
                r#"
[feishu]
app_secret = "${TEST_FEISHU_APP_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.feishu.app_secret.expose_secret() == "interp-secret",
                "app secret should come from environment interpolation",
            )
        })();

        clear_vars(&["TEST_FEISHU_APP_SECRET", "FEISHU_APP_ID", "FEISHU_APP_SECRET"]);
        result
    }

    #[test]
    fn automation_env_table_is_honored() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        base_env();
        env::set_var("AUTOMATION_ENABLED", "true");
        env::set_var("AUTOMATION_ACTION_MAX_RETRIES", "5");
        env::set_var("AUTOMATION_HTTP_ALLOWED_DOMAINS", "hooks.example.com, api.example.cn");
        env::set_var("AUTOMATION_WEBHOOK_TIMESTAMP_TOLERANCE_SECONDS", "120");
        env::set_var("ROLE", "automation_worker");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.automation.enabled, "automation should be enabled")?;
            ensure(config.automation.action_max_retries == 5, "retry count from env")?;
            ensure(
                config.automation.http_allowed_domains
                    == vec!["hooks.example.com".to_string(), "api.example.cn".to_string()],
                "allowed domains should be split and normalized",
            )?;
            ensure(
                config.automation.webhook_timestamp_tolerance_secs == 120,
                "tolerance window from env",
            )?;
            ensure(config.server.role == Role::AutomationWorker, "role from env")
        })();

        clear_vars(&[
            "FEISHU_APP_ID",
            "FEISHU_APP_SECRET",
            "AUTOMATION_ENABLED",
            "AUTOMATION_ACTION_MAX_RETRIES",
            "AUTOMATION_HTTP_ALLOWED_DOMAINS",
            "AUTOMATION_WEBHOOK_TIMESTAMP_TOLERANCE_SECONDS",
            "ROLE",
        ]);
        result
    }

    #[test]
    fn task_llm_falls_back_to_chat_endpoint() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        base_env();
        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                config.llm.task_endpoint().model == config.llm.chat.model,
                "task endpoint should fall back to chat when unset",
            )
        })();

        clear_vars(&["FEISHU_APP_ID", "FEISHU_APP_SECRET"]);
        result
    }

    #[test]
    fn task_llm_env_splits_models() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        base_env();
        env::set_var("LLM_MODEL", "chat-model");
        env::set_var("TASK_LLM_MODEL", "task-model");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.llm.chat.model == "chat-model", "chat model from env")?;
            ensure(config.llm.task_endpoint().model == "task-model", "task model from env")
        })();

        clear_vars(&["FEISHU_APP_ID", "FEISHU_APP_SECRET", "LLM_MODEL", "TASK_LLM_MODEL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FEISHU_APP_ID", "not-a-cli-id");
        env::set_var("FEISHU_APP_SECRET", "secret");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("feishu.app_id")
            );
            ensure(has_message, "validation failure should mention feishu.app_id")
        })();

        clear_vars(&["FEISHU_APP_ID", "FEISHU_APP_SECRET"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FEISHU_APP_ID", "cli_test");
        env::set_var("FEISHU_APP_SECRET", "super-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("super-secret-value"),
                "debug output should not contain the app secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["FEISHU_APP_ID", "FEISHU_APP_SECRET"]);
        result
    }

    #[test]
    fn overrides_win_over_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        base_env();
        env::set_var("CASEBOOK_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions {
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "programmatic override should win over env",
            )
        })();

        clear_vars(&["FEISHU_APP_ID", "FEISHU_APP_SECRET", "CASEBOOK_DATABASE_URL"]);
        result
    }
}
