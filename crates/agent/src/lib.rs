//! Conversation orchestrator: the "brain" of the assistant.
//!
//! Inbound chat messages run through a fixed pipeline:
//! 1. **Dedup** — channel retransmits produce exactly one reply
//! 2. **L0 rules** (`l0`) — deterministic short-circuits: empty input, bulk
//!    destructive phrasing, pending-action confirmation, pagination, ordinal
//!    referents
//! 3. **Intent parsing** (`intent`) — keyword rules first, LLM fallback ladder
//! 4. **Routing** (`router`) — skill chains bounded by `max_hops`
//! 5. **Skills** (`skills`) — query / create / update / delete / summary /
//!    reminder / chitchat against the tool server
//! 6. **Rendering** (`renderer`) — channel-neutral response with text fallback
//!
//! The LLM is strictly a classifier/summarizer. Every data mutation flows
//! through the tool server with its own validation; destructive operations
//! always require an explicit confirmation turn.

pub mod intent;
pub mod l0;
pub mod llm;
pub mod orchestrator;
pub mod reminders;
pub mod renderer;
pub mod router;
pub mod session;
pub mod skills;
pub mod timeparse;
pub mod tool_client;

pub use intent::{IntentConfig, IntentParser, IntentResult, ParseMethod};
pub use l0::{evaluate as l0_evaluate, L0Decision};
pub use llm::{HttpLlmClient, LlmClient};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use reminders::ReminderDispatcher;
pub use router::SkillRouter;
pub use session::{ConversationState, PendingAction, PendingKind, SessionManager};
pub use skills::{Skill, SkillContext, SkillResult, SkillSettings};
pub use tool_client::{HttpToolClient, ToolClient};
