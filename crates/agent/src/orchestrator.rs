use std::sync::Arc;
use std::time::Duration;

use casebook_core::AgentError;
use casebook_db::ReminderStore;
use casebook_feishu::{InboundMessage, MessageDeduplicator, RenderedResponse};
use tracing::info;

use crate::intent::{IntentConfig, IntentParser};
use crate::l0::{self, L0Decision};
use crate::llm::LlmClient;
use crate::renderer;
use crate::router::SkillRouter;
use crate::session::SessionManager;
use crate::skills::{
    ChitchatSkill, CreateSkill, DeleteSkill, QuerySkill, ReminderSkill, SkillContext,
    SkillResult, SkillSettings, SummarySkill, Turn, UpdateSkill,
};
use crate::tool_client::ToolClient;

const DEDUP_TTL: Duration = Duration::from_secs(600);
const DEDUP_CAPACITY: usize = 4096;
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Builder enforcing collaborator injection: a missing tool client (the data
/// writer) is a startup fatal, never a lazy failure at first use.
#[derive(Default)]
pub struct OrchestratorBuilder {
    tool_client: Option<Arc<dyn ToolClient>>,
    chat_llm: Option<Arc<dyn LlmClient>>,
    task_llm: Option<Arc<dyn LlmClient>>,
    reminders: Option<Arc<ReminderStore>>,
    settings: Option<SkillSettings>,
    intent_config: Option<IntentConfig>,
}

impl OrchestratorBuilder {
    pub fn tool_client(mut self, tool_client: Arc<dyn ToolClient>) -> Self {
        self.tool_client = Some(tool_client);
        self
    }

    pub fn chat_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.chat_llm = Some(llm);
        self
    }

    pub fn task_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.task_llm = Some(llm);
        self
    }

    pub fn reminders(mut self, store: Arc<ReminderStore>) -> Self {
        self.reminders = Some(store);
        self
    }

    pub fn settings(mut self, settings: SkillSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn intent_config(mut self, config: IntentConfig) -> Self {
        self.intent_config = Some(config);
        self
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let tool_client =
            self.tool_client.ok_or(AgentError::MissingCollaborator("tool client"))?;
        let settings = self.settings.unwrap_or_default();
        if settings.default_table_id.is_empty() {
            return Err(AgentError::MissingCollaborator("default table configuration"));
        }

        let intent_config = self.intent_config.unwrap_or_default();
        let max_hops = intent_config.max_hops;

        let mut router = SkillRouter::new(max_hops);
        router.register(QuerySkill);
        router.register(CreateSkill);
        router.register(UpdateSkill);
        router.register(DeleteSkill);
        router.register(SummarySkill);
        router.register(ReminderSkill);
        router.register(ChitchatSkill);

        Ok(Orchestrator {
            context: SkillContext {
                tools: tool_client,
                task_llm: self.task_llm.clone(),
                chat_llm: self.chat_llm,
                reminders: self.reminders,
                settings,
            },
            intent: IntentParser::new(intent_config, self.task_llm),
            router,
            sessions: SessionManager::new(SESSION_TTL),
            dedup: std::sync::Mutex::new(MessageDeduplicator::new(DEDUP_TTL, DEDUP_CAPACITY)),
        })
    }
}

/// The conversation pipeline: dedup → session → L0 → intent → router →
/// renderer. Processing per `open_id` is serialized by the session lock.
pub struct Orchestrator {
    context: SkillContext,
    intent: IntentParser,
    router: SkillRouter,
    sessions: SessionManager,
    dedup: std::sync::Mutex<MessageDeduplicator>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Handles one inbound message. Returns `None` for channel retransmits
    /// (exactly one reply per unique message id).
    pub async fn handle_message(&self, message: &InboundMessage) -> Option<RenderedResponse> {
        {
            let mut dedup =
                self.dedup.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if dedup.check_and_mark(&message.message_id) {
                info!(
                    event_name = "agent.message.duplicate",
                    message_id = %message.message_id,
                    "channel retransmit dropped"
                );
                return None;
            }
        }

        let session = self.sessions.session(&message.open_id);
        let mut state = session.lock().await;
        state.last_active = Some(casebook_core::chrono::Utc::now());
        state.push_history("user", &message.text);

        let (skill_names, forced_payload) = match l0::evaluate(&mut state, &message.text) {
            L0Decision::Reply(reply) => {
                state.push_history("assistant", &reply);
                return Some(renderer::render("l0", &SkillResult::ok(reply)));
            }
            L0Decision::ForceSkill { skill, payload } => {
                (vec![skill.to_owned()], Some(payload))
            }
            L0Decision::PassThrough => {
                let intent = self.intent.parse(&message.text).await;
                (intent.skills, None)
            }
        };

        let mut turn = Turn {
            open_id: &message.open_id,
            text: &message.text,
            state: &mut state,
            forced_payload,
            chained_data: None,
        };
        let result = self.router.dispatch(&self.context, &mut turn, &skill_names).await;

        let skill_label = skill_names.first().map(String::as_str).unwrap_or("chitchat");
        let response = renderer::render(skill_label, &result);
        state.push_history("assistant", &response.text_fallback);
        Some(response)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use casebook_feishu::InboundMessage;
    use serde_json::json;

    use crate::skills::test_support::FakeTools;
    use crate::skills::SkillSettings;

    use super::Orchestrator;

    fn message(id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_owned(),
            open_id: "ou_A".to_owned(),
            chat_id: "oc_1".to_owned(),
            text: text.to_owned(),
        }
    }

    fn settings() -> SkillSettings {
        let mut settings = SkillSettings::default();
        settings.default_app_token = "appA".into();
        settings.default_table_id = "tblCases".into();
        settings
    }

    fn orchestrator(tools: Arc<FakeTools>) -> Orchestrator {
        Orchestrator::builder()
            .tool_client(tools)
            .settings(settings())
            .build()
            .expect("orchestrator builds")
    }

    #[test]
    fn missing_tool_client_is_a_startup_fatal() {
        let result = Orchestrator::builder().settings(settings()).build();
        assert!(result.is_err(), "the data writer is a required collaborator");
    }

    #[test]
    fn missing_table_config_is_a_startup_fatal() {
        let result =
            Orchestrator::builder().tool_client(Arc::new(FakeTools::default())).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retransmitted_message_ids_get_exactly_one_reply() {
        let orchestrator = orchestrator(Arc::new(FakeTools::default()));

        let first = orchestrator.handle_message(&message("om_1", "你好")).await;
        assert!(first.is_some());
        let second = orchestrator.handle_message(&message("om_1", "你好")).await;
        assert!(second.is_none(), "retransmit must not produce a second reply");
    }

    #[tokio::test]
    async fn my_cases_flow_queries_and_remembers_results() {
        let tools = Arc::new(FakeTools::default());
        tools
            .seed("rec_mine", json!({"主办律师": [{"id": "ou_A"}], "案号": "A-1", "案由": "合同纠纷"}))
            .await;
        let orchestrator = orchestrator(tools);

        let reply = orchestrator
            .handle_message(&message("om_1", "我的案件"))
            .await
            .expect("reply");
        assert!(reply.text_fallback.contains("找到 1 条"));

        // Ordinal referent resolves against the remembered result.
        let detail = orchestrator
            .handle_message(&message("om_2", "第1个"))
            .await
            .expect("reply");
        assert!(detail.text_fallback.contains("A-1"));
    }

    #[tokio::test]
    async fn delete_confirm_cancel_round_trip() {
        let tools = Arc::new(FakeTools::default());
        tools.seed("rec42", json!({"案号": "P-0042"})).await;
        let orchestrator = orchestrator(tools.clone());

        let ask = orchestrator
            .handle_message(&message("om_1", "删除 P-0042"))
            .await
            .expect("reply");
        assert!(ask.text_fallback.contains("确认"));

        let cancelled = orchestrator
            .handle_message(&message("om_2", "取消"))
            .await
            .expect("reply");
        assert!(cancelled.text_fallback.contains("已取消"));
        assert_eq!(tools.records.lock().await.len(), 1, "record survives the cancel");

        // Ask again, then confirm.
        orchestrator.handle_message(&message("om_3", "删除 P-0042")).await;
        let confirmed = orchestrator
            .handle_message(&message("om_4", "确认"))
            .await
            .expect("reply");
        assert!(confirmed.text_fallback.contains("已删除"), "{}", confirmed.text_fallback);
        assert!(tools.records.lock().await.is_empty());
    }

    #[tokio::test]
    async fn create_with_slot_completion_across_turns() {
        let tools = Arc::new(FakeTools::default());
        let orchestrator = orchestrator(tools.clone());

        let ask = orchestrator
            .handle_message(&message("om_1", "新建案件 案号 (2026)沪01民终1号 委托人 张三"))
            .await
            .expect("reply");
        assert!(ask.text_fallback.contains("案由"));

        let done = orchestrator
            .handle_message(&message("om_2", "合同纠纷"))
            .await
            .expect("reply");
        assert!(done.text_fallback.contains("已创建"), "{}", done.text_fallback);

        let records = tools.records.lock().await;
        let (_, fields) = records.iter().next().expect("record");
        assert_eq!(fields["案由"], "合同纠纷");
    }

    #[tokio::test]
    async fn bulk_delete_is_refused_by_the_skill_layer_with_a_stable_code() {
        let tools = Arc::new(FakeTools::default());
        let orchestrator = orchestrator(tools.clone());
        let reply = orchestrator
            .handle_message(&message("om_1", "删掉所有案件"))
            .await
            .expect("reply");
        assert!(reply.text_fallback.contains("不支持批量删除"));
        assert_eq!(reply.meta.get("skill").map(String::as_str), Some("delete"));
        assert_eq!(
            reply.meta.get("code").map(String::as_str),
            Some("delete_disabled"),
            "the refusal must come from DeleteSkill, not L0"
        );
        assert!(tools.calls.lock().await.is_empty());
    }
}
