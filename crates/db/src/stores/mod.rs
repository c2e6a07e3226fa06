use thiserror::Error;

pub mod checkpoint;
pub mod cron;
pub mod dead_letter;
pub mod delay;
pub mod idempotency;
pub mod reminder;
pub mod run_log;
pub mod snapshot;

pub use checkpoint::CheckpointStore;
pub use cron::{CronJob, CronStatus, CronStore, NewCronJob};
pub use dead_letter::{DeadLetterRow, DeadLetterStore};
pub use delay::{DelayTask, DelayTaskStatus, DelayTaskStore};
pub use idempotency::IdempotencyStore;
pub use reminder::{NewReminder, Reminder, ReminderPriority, ReminderStatus, ReminderStore};
pub use run_log::{ActionDetail, ChangedPair, RunLogQuery, RunLogRow, RunLogStore, RunResult};
pub use snapshot::SnapshotStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}
