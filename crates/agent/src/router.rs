use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::skills::{Skill, SkillContext, SkillResult, Turn};

/// Executes a (possibly chained) skill list. The first skill's result data
/// becomes the next skill's implicit context; a failing hop ends the chain.
pub struct SkillRouter {
    skills: HashMap<&'static str, Arc<dyn Skill>>,
    max_hops: usize,
}

impl SkillRouter {
    pub fn new(max_hops: usize) -> Self {
        Self { skills: HashMap::new(), max_hops: max_hops.max(1) }
    }

    pub fn register<S>(&mut self, skill: S)
    where
        S: Skill + 'static,
    {
        self.skills.insert(skill.name(), Arc::new(skill));
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }

    pub fn has_skill(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    pub async fn dispatch(
        &self,
        context: &SkillContext,
        turn: &mut Turn<'_>,
        skill_names: &[String],
    ) -> SkillResult {
        let mut queue: Vec<String> = skill_names.iter().take(self.max_hops).cloned().collect();
        let mut chained_data: Option<Value> = turn.chained_data.take();
        let mut messages: Vec<String> = Vec::new();
        let mut last = SkillResult::failed("没有可执行的技能。");
        let mut hops = 0;

        while let Some(name) = if queue.is_empty() { None } else { Some(queue.remove(0)) } {
            if hops >= self.max_hops {
                warn!(
                    event_name = "agent.router.max_hops",
                    max_hops = self.max_hops,
                    "skill chain truncated"
                );
                break;
            }
            hops += 1;

            let Some(skill) = self.skills.get(name.as_str()) else {
                warn!(event_name = "agent.router.unknown_skill", skill = %name, "no such skill");
                last = SkillResult::failed("我还不会这个操作。");
                break;
            };

            turn.chained_data = chained_data.take();
            info!(event_name = "agent.router.dispatch", skill = %name, hop = hops, "running skill");
            let result = skill.handle(context, turn).await;

            if !result.message.is_empty() {
                messages.push(result.message.clone());
            }
            chained_data = result.data.clone();
            let next = result.next_skill.clone();
            let failed = !result.ok;
            last = result;

            if failed {
                break;
            }
            if let Some(next) = next {
                if hops + queue.len() < self.max_hops {
                    queue.push(next);
                }
            }
        }

        // A chain's reply is the concatenation of each hop's message.
        if messages.len() > 1 {
            last.message = messages.join("\n\n");
        }
        last
    }
}
