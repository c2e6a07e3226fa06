use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use casebook_core::chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

/// The single conversational continuation slot. At most one per
/// conversation; a new one supersedes the old with a user-visible notice.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAction {
    pub kind: PendingKind,
    /// Which skill resolves this continuation.
    pub owner_skill: &'static str,
    pub target_record_id: Option<String>,
    pub target_table_id: Option<String>,
    pub summary: String,
    pub payload: Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingKind {
    ConfirmDelete,
    ConfirmUpdate,
    CompleteFields,
}

const HISTORY_LIMIT: usize = 20;

/// Per-conversation state keyed by `open_id`.
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    pub active_table: Option<String>,
    pub active_record: Option<String>,
    pub last_result_ids: Vec<String>,
    /// Raw data of the last query result, consumed by SummarySkill.
    pub last_result: Option<Value>,
    /// Pagination cursor of the last query, if it had more pages.
    pub next_page_token: Option<String>,
    pub last_query_params: Option<Value>,
    pending: Option<PendingAction>,
    pub history: VecDeque<(String, String)>,
    pub slot_memory: HashMap<String, String>,
    pub last_active: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn pending(&self) -> Option<&PendingAction> {
        match &self.pending {
            Some(pending) if pending.expires_at > Utc::now() => Some(pending),
            _ => None,
        }
    }

    /// Installs a pending action, returning the one it superseded (if any).
    pub fn set_pending(&mut self, pending: PendingAction) -> Option<PendingAction> {
        let superseded = self.pending.take().filter(|old| old.expires_at > Utc::now());
        self.pending = Some(pending);
        superseded
    }

    pub fn clear_pending(&mut self) -> Option<PendingAction> {
        self.pending.take()
    }

    pub fn push_history(&mut self, role: &str, text: &str) {
        self.history.push_back((role.to_owned(), text.to_owned()));
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    pub fn remember_result(&mut self, record_ids: Vec<String>, data: Value) {
        self.last_result_ids = record_ids;
        self.last_result = Some(data);
    }
}

/// Owns conversation state with an idle TTL (≥ 30 minutes). Each state sits
/// behind its own async mutex so processing per `open_id` is serialized while
/// different conversations proceed in parallel.
pub struct SessionManager {
    ttl: Duration,
    sessions: std::sync::Mutex<HashMap<String, SessionSlot>>,
}

struct SessionSlot {
    state: Arc<Mutex<ConversationState>>,
    last_touched: DateTime<Utc>,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.max(Duration::from_secs(30 * 60)),
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Fetches (or creates) the state handle for a conversation and sweeps
    /// expired sessions.
    pub fn session(&self, open_id: &str) -> Arc<Mutex<ConversationState>> {
        let now = Utc::now();
        let ttl = casebook_core::chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| casebook_core::chrono::Duration::minutes(30));

        let mut sessions =
            self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.retain(|_, slot| now - slot.last_touched <= ttl);

        let slot = sessions.entry(open_id.to_owned()).or_insert_with(|| SessionSlot {
            state: Arc::new(Mutex::new(ConversationState::default())),
            last_touched: now,
        });
        slot.last_touched = now;
        slot.state.clone()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
