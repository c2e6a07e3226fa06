use std::sync::Arc;
use std::time::Duration;

use casebook_core::chrono::Utc;
use casebook_db::ReminderStore;
use casebook_feishu::MessageSender;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::timeparse::conversation_tz;

const LOCK_TTL_SECS: i64 = 300;
const CLAIM_BATCH: u32 = 50;

/// Background reminder dispatcher. Claims due reminders with the store's
/// advisory lock, pushes them through the dedupe gateway keyed
/// `(business_id, target_day, offset)`, and delivers via the channel sender.
pub struct ReminderDispatcher {
    store: Arc<ReminderStore>,
    sender: Arc<dyn MessageSender>,
    instance_id: String,
}

impl ReminderDispatcher {
    pub fn new(store: Arc<ReminderStore>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            store,
            sender,
            instance_id: format!("reminder-{}", Uuid::new_v4()),
        }
    }

    /// One dispatch sweep; returns how many reminders were delivered.
    pub async fn run_once(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let due = match self
            .store
            .claim_due(&self.instance_id, now_ms, LOCK_TTL_SECS, CLAIM_BATCH)
            .await
        {
            Ok(due) => due,
            Err(error) => {
                warn!(
                    event_name = "agent.reminder.claim_failed",
                    error = %error,
                    "reminder store unavailable"
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for reminder in due {
            let target_day = casebook_core::chrono::DateTime::from_timestamp_millis(reminder.due_at)
                .map(|due| due.with_timezone(&conversation_tz()).date_naive().to_string())
                .unwrap_or_default();

            let fresh = match self.store.record_dispatch(&reminder.id, &target_day, 0).await {
                Ok(fresh) => fresh,
                Err(error) => {
                    warn!(
                        event_name = "agent.reminder.gateway_failed",
                        reminder_id = %reminder.id,
                        error = %error,
                        "dedupe gateway unavailable, releasing claim"
                    );
                    let _ = self
                        .store
                        .release_failed(&reminder.id, &self.instance_id, "dedupe gateway failed")
                        .await;
                    continue;
                }
            };
            if !fresh {
                // Another instance already delivered this slot.
                info!(
                    event_name = "agent.reminder.duplicate_slot",
                    reminder_id = %reminder.id,
                    target_day = %target_day,
                    "dispatch slot already used"
                );
                let _ = self.store.mark_notified(&reminder.id, &self.instance_id).await;
                continue;
            }

            let text = format!("⏰ 提醒：{}", reminder.content);
            match self.sender.send_text(&reminder.user_id, &text).await {
                Ok(()) => {
                    if let Err(error) =
                        self.store.mark_notified(&reminder.id, &self.instance_id).await
                    {
                        warn!(
                            event_name = "agent.reminder.mark_failed",
                            reminder_id = %reminder.id,
                            error = %error,
                            "delivered but could not mark notified"
                        );
                    }
                    delivered += 1;
                    info!(
                        event_name = "agent.reminder.delivered",
                        reminder_id = %reminder.id,
                        user_id = %reminder.user_id,
                        "reminder delivered"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "agent.reminder.send_failed",
                        reminder_id = %reminder.id,
                        error = %error,
                        "channel send failed, claim released"
                    );
                    // The slot was reserved before the send; free it so the
                    // retry can deliver.
                    let _ = self.store.remove_dispatch(&reminder.id, &target_day, 0).await;
                    let _ = self
                        .store
                        .release_failed(&reminder.id, &self.instance_id, &error.to_string())
                        .await;
                }
            }
        }
        delivered
    }

    pub fn spawn(self: Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.clamp(5, 3600)));
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use casebook_core::UpstreamError;
    use casebook_db::{stores::reminder::NewReminder, ReminderPriority, ReminderStatus, ReminderStore};
    use casebook_feishu::{MessageSender, RenderedResponse};
    use tokio::sync::Mutex;

    use super::ReminderDispatcher;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_text(&self, open_id: &str, text: &str) -> Result<(), UpstreamError> {
            if *self.fail.lock().await {
                return Err(UpstreamError::Network("injected".into()));
            }
            self.sent.lock().await.push((open_id.to_owned(), text.to_owned()));
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

    async fn store() -> Arc<ReminderStore> {
        let pool =
            casebook_db::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        casebook_db::migrations::run_pending(&pool).await.expect("migrations");
        Arc::new(ReminderStore::new(pool))
    }

    fn due_reminder(content: &str) -> NewReminder {
        NewReminder {
            user_id: "ou_A".to_owned(),
            content: content.to_owned(),
            due_at: 1_000,
            priority: ReminderPriority::Medium,
            case_id: None,
            chat_id: None,
            source: "manual".to_owned(),
        }
    }

    #[tokio::test]
    async fn due_reminders_are_delivered_once() {
        let store = store().await;
        store.create(due_reminder("准备开庭材料")).await.expect("create");
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = ReminderDispatcher::new(store.clone(), sender.clone());

        assert_eq!(dispatcher.run_once().await, 1);
        assert_eq!(dispatcher.run_once().await, 0, "second sweep finds nothing");

        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("准备开庭材料"));

        let done = store
            .list_for_user("ou_A", Some(ReminderStatus::Done), 10)
            .await
            .expect("list");
        assert_eq!(done.len(), 1);
    }

    #[tokio::test]
    async fn send_failure_releases_the_claim_for_retry() {
        let store = store().await;
        let created = store.create(due_reminder("材料")).await.expect("create");
        let sender = Arc::new(RecordingSender::default());
        *sender.fail.lock().await = true;
        let dispatcher = ReminderDispatcher::new(store.clone(), sender.clone());

        assert_eq!(dispatcher.run_once().await, 0);
        let reminder = store.get(&created.id).await.expect("get").expect("present");
        assert_eq!(reminder.status, ReminderStatus::Pending);
        assert_eq!(reminder.retry_count, 1);

        // The failed attempt freed its dispatch slot, so the retry delivers.
        *sender.fail.lock().await = false;
        assert_eq!(dispatcher.run_once().await, 1);
        let reminder = store.get(&created.id).await.expect("get").expect("present");
        assert_eq!(reminder.status, ReminderStatus::Done);
        assert_eq!(sender.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn two_dispatchers_deliver_a_reminder_exactly_once() {
        let store = store().await;
        store.create(due_reminder("唯一提醒")).await.expect("create");
        let sender = Arc::new(RecordingSender::default());
        let first = ReminderDispatcher::new(store.clone(), sender.clone());
        let second = ReminderDispatcher::new(store.clone(), sender.clone());

        let delivered = first.run_once().await + second.run_once().await;
        assert_eq!(delivered, 1);
        assert_eq!(sender.sent.lock().await.len(), 1);
    }
}
