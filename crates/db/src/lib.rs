pub mod connection;
pub mod migrations;
pub mod stores;

pub use connection::{connect, connect_with_settings, DbPool};
pub use stores::{
    ActionDetail, ChangedPair, CheckpointStore, CronJob, CronStatus, CronStore, DeadLetterRow,
    DeadLetterStore, DelayTask, DelayTaskStatus, DelayTaskStore, IdempotencyStore, NewCronJob,
    NewReminder, Reminder, ReminderPriority, ReminderStatus, ReminderStore, RunLogQuery,
    RunLogRow, RunLogStore, RunResult, SnapshotStore, StoreError,
};
