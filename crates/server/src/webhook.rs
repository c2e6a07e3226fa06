use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use casebook_agent::Orchestrator;
use casebook_core::config::FeishuConfig;
use casebook_db::DbPool;
use casebook_feishu::{
    verify_and_normalize, InboundDecision, MessageSender, WebhookContext, WebhookError,
};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Channel webhook state: the orchestrator, the outbound sender, and the
/// store pool the readiness probe checks.
#[derive(Clone)]
pub struct WebhookState {
    pub orchestrator: Arc<Orchestrator>,
    pub sender: Arc<dyn MessageSender>,
    pub feishu: Arc<FeishuConfig>,
    pub db_pool: DbPool,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/feishu/webhook", post(webhook).get(webhook_probe))
        .route("/health", get(crate::health::health_probe))
        .with_state(state)
}

async fn webhook_probe() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Channel callback. The handshake is answered inline; message processing is
/// deferred to a background task so the channel gets its 200 within 1 s.
async fn webhook(
    State(state): State<WebhookState>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let context = WebhookContext {
        verification_token: &state.feishu.verification_token,
        encrypt_key: state.feishu.encrypt_key.as_ref(),
        bot_open_id: None,
    };

    match verify_and_normalize(payload, &context) {
        Ok(InboundDecision::Challenge(challenge)) => {
            (StatusCode::OK, Json(json!({"challenge": challenge})))
        }
        Ok(InboundDecision::Ignored(reason)) => {
            info!(event_name = "channel.webhook.ignored", reason, "payload ignored");
            (StatusCode::OK, Json(json!({"status": "ignored"})))
        }
        Ok(InboundDecision::Message(message)) => {
            let orchestrator = state.orchestrator.clone();
            let sender = state.sender.clone();
            tokio::spawn(async move {
                let Some(response) = orchestrator.handle_message(&message).await else {
                    return;
                };
                if let Err(error) = sender.send_response(&message.open_id, &response).await {
                    warn!(
                        event_name = "channel.webhook.reply_failed",
                        open_id = %message.open_id,
                        error = %error,
                        "reply delivery failed"
                    );
                }
            });
            (StatusCode::OK, Json(json!({"status": "ok"})))
        }
        Err(WebhookError::TokenMismatch) => {
            // Signature failures are dropped with a log entry and no reply
            // body that would leak verification state.
            warn!(event_name = "channel.webhook.token_mismatch", "verification failed");
            (StatusCode::OK, Json(json!({"status": "ok"})))
        }
        Err(error) => {
            warn!(event_name = "channel.webhook.malformed", error = %error, "payload rejected");
            (StatusCode::BAD_REQUEST, Json(json!({"status": "error"})))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use casebook_agent::skills::SkillSettings;
    use casebook_agent::{Orchestrator, ToolClient};
    use casebook_core::config::AppConfig;
    use casebook_core::{AgentError, UpstreamError};
    use casebook_db::DbPool;
    use casebook_feishu::{MessageSender, RenderedResponse};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use super::WebhookState;

    pub struct NullTools;

    #[async_trait]
    impl ToolClient for NullTools {
        async fn call(&self, _tool: &str, _params: Value) -> Result<Value, AgentError> {
            Ok(json!({"items": [], "has_more": false, "page_token": null}))
        }
    }

    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_text(&self, _open_id: &str, text: &str) -> Result<(), UpstreamError> {
            self.sent.lock().await.push(text.to_owned());
            Ok(())
        }

        async fn send_response(
            &self,
            open_id: &str,
            response: &RenderedResponse,
        ) -> Result<(), UpstreamError> {
            self.send_text(open_id, &response.text_fallback).await
        }
    }

    pub fn webhook_state(sender: Arc<RecordingSender>, db_pool: DbPool) -> WebhookState {
        let mut settings = SkillSettings::default();
        settings.default_app_token = "appA".into();
        settings.default_table_id = "tblCases".into();

        let orchestrator = Orchestrator::builder()
            .tool_client(Arc::new(NullTools))
            .settings(settings)
            .build()
            .expect("orchestrator builds");

        let mut feishu = AppConfig::default().feishu;
        feishu.verification_token = "tok".to_owned().into();

        WebhookState {
            orchestrator: Arc::new(orchestrator),
            sender,
            feishu: Arc::new(feishu),
            db_pool,
        }
    }

    pub fn webhook_state_with_pool(db_pool: DbPool) -> WebhookState {
        webhook_state(Arc::new(RecordingSender::default()), db_pool)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::Json;
    use serde_json::{json, Value};

    use super::test_support::{webhook_state, RecordingSender};
    use super::{webhook, WebhookState};

    async fn state(sender: Arc<RecordingSender>) -> WebhookState {
        let pool = casebook_db::connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        webhook_state(sender, pool)
    }

    fn message_payload(message_id: &str) -> Value {
        json!({
            "header": {"event_id": "evt-1", "token": "tok"},
            "event": {
                "sender": {"sender_type": "user", "sender_id": {"open_id": "ou_A"}},
                "message": {
                    "message_id": message_id,
                    "chat_id": "oc_1",
                    "chat_type": "p2p",
                    "message_type": "text",
                    "content": "{\"text\":\"你好\"}"
                }
            }
        })
    }

    #[tokio::test]
    async fn challenge_is_answered_inline() {
        let sender = Arc::new(RecordingSender::default());
        let (status, Json(body)) = webhook(
            State(state(sender).await),
            Json(json!({"type": "url_verification", "token": "tok", "challenge": "c-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["challenge"], "c-1");
    }

    #[tokio::test]
    async fn bad_token_is_dropped_without_detail() {
        let sender = Arc::new(RecordingSender::default());
        let (status, Json(body)) = webhook(
            State(state(sender.clone()).await),
            Json(json!({"type": "url_verification", "token": "wrong", "challenge": "c-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("challenge").is_none());
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn messages_are_accepted_and_replied_in_the_background() {
        let sender = Arc::new(RecordingSender::default());
        let (status, Json(body)) =
            webhook(State(state(sender.clone()).await), Json(message_payload("om_1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        // Let the background task run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sender.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn retransmits_produce_exactly_one_reply() {
        let sender = Arc::new(RecordingSender::default());
        let state = state(sender.clone()).await;
        webhook(State(state.clone()), Json(message_payload("om_dup"))).await;
        webhook(State(state), Json(message_payload("om_dup"))).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sender.sent.lock().await.len(), 1, "one reply for two deliveries");
    }
}
