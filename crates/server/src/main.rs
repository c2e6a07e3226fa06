//! Conversation orchestrator process: channel webhook + health + reminder
//! dispatcher. The tool server and automation worker run as separate
//! processes (`casebook-mcp` with its ROLE flag).

mod bootstrap;
mod health;
mod webhook;

use std::process::ExitCode;
use std::sync::Arc;

use casebook_core::config::{AppConfig, LoadOptions, LogFormat};
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

    let app = match bootstrap::bootstrap(LoadOptions::default()).await {
        Ok(app) => app,
        Err(bootstrap_error) => {
            error!(
                event_name = "system.bootstrap.failed",
                error = %bootstrap_error,
                "startup failed"
            );
            return ExitCode::from(1);
        }
    };

    if let Some(dispatcher) = app.reminder_dispatcher.clone() {
        dispatcher.spawn(app.config.reminder.dispatch_interval_secs);
        info!(event_name = "system.reminder.scheduler_started", "reminder dispatcher running");
    }

    let state = webhook::WebhookState {
        orchestrator: app.orchestrator.clone(),
        sender: app.sender.clone(),
        feishu: Arc::new(app.config.feishu.clone()),
        db_pool: app.db_pool.clone(),
    };
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(bind_error) => {
            error!(
                event_name = "system.bind.failed",
                bind_address = %address,
                error = %bind_error,
                "could not bind the webhook listener"
            );
            return ExitCode::from(1);
        }
    };
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "casebook orchestrator started"
    );

    let serve = axum::serve(listener, webhook::router(state))
        .with_graceful_shutdown(wait_for_shutdown());
    if let Err(serve_error) = serve.await {
        error!(
            event_name = "system.runtime.failed",
            error = %serve_error,
            "webhook server terminated unexpectedly"
        );
        return ExitCode::from(2);
    }

    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "casebook orchestrator stopping"
    );
    ExitCode::SUCCESS
}

fn init_tracing(config: &AppConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
