// Agent execution: one completion per task, or a planned multi-agent run for the orchestrator.
use crate::core::config::LlmConfig;
use crate::core::time_utils::now_ts;
use crate::services::agents::{
    AgentRegistry, AgentSpec, FALLBACK_AGENT, ORCHESTRATOR, PLANNER_PROMPT,
};
use crate::services::llm::{truncate_text, ChatMessage, CompletionBackend, LlmSettings};
use crate::storage::{
    StorageBackend, SubTaskRecord, TaskRecord, TASK_STATUS_COMPLETED, TASK_STATUS_FAILED,
    TASK_STATUS_IN_PROGRESS, TASK_STATUS_PENDING,
};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_PLAN_STEPS: usize = 5;
const PREVIOUS_RESULT_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub agent: String,
    pub description: String,
}

/// Runs a synchronous storage call on the blocking pool.
pub async fn run_storage<T, F>(storage: &Arc<dyn StorageBackend>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn StorageBackend) -> Result<T> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || op(storage.as_ref()))
        .await
        .map_err(|err| anyhow!("storage task join failed: {err}"))?
}

pub struct TaskExecutor {
    storage: Arc<dyn StorageBackend>,
    llm: Arc<dyn CompletionBackend>,
    agents: AgentRegistry,
    llm_config: LlmConfig,
}

impl TaskExecutor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        llm: Arc<dyn CompletionBackend>,
        agents: AgentRegistry,
        llm_config: LlmConfig,
    ) -> Self {
        Self {
            storage,
            llm,
            agents,
            llm_config,
        }
    }

    pub fn resolve_agent(&self, task: &TaskRecord) -> &'static AgentSpec {
        self.agents
            .resolve_for_task(task.agent_name.as_deref(), task.task_type.as_deref())
    }

    pub async fn llm_settings_for(&self, user_id: i64) -> Result<LlmSettings> {
        let row = run_storage(&self.storage, move |storage| {
            storage.get_user_settings(user_id)
        })
        .await?;
        Ok(LlmSettings::resolve(&self.llm_config, row.as_ref()))
    }

    /// Produces the task result; the caller owns status bookkeeping.
    pub async fn execute(&self, task: &TaskRecord) -> Result<Value> {
        let agent = self.resolve_agent(task);
        let settings = self.llm_settings_for(task.user_id).await?;
        let prompt = task_prompt(task);
        if prompt.is_empty() {
            return Err(anyhow!("task has no query, description or title"));
        }
        if agent.name == ORCHESTRATOR {
            self.run_orchestrated(task, &settings, &prompt).await
        } else {
            self.run_single(agent, &settings, &prompt).await
        }
    }

    async fn run_single(
        &self,
        agent: &AgentSpec,
        settings: &LlmSettings,
        prompt: &str,
    ) -> Result<Value> {
        let messages = [
            ChatMessage::system(agent.system_prompt),
            ChatMessage::user(prompt),
        ];
        let response = self.llm.complete(settings, &messages).await?;
        Ok(json!({
            "agent": agent.name,
            "content": response.content,
            "model": response.model,
            "mocked": response.mocked,
            "total_tokens": response.total_tokens,
        }))
    }

    async fn run_orchestrated(
        &self,
        task: &TaskRecord,
        settings: &LlmSettings,
        prompt: &str,
    ) -> Result<Value> {
        let plan = self.plan(settings, prompt).await;
        debug!("task {} planned {} step(s)", task.id, plan.len());

        let task_id = task.id;
        let steps = plan.clone();
        let mut subtasks = run_storage(&self.storage, move |storage| {
            let now = now_ts();
            let mut created = Vec::with_capacity(steps.len());
            for (index, step) in steps.into_iter().enumerate() {
                let mut record = SubTaskRecord {
                    id: 0,
                    task_id,
                    agent_name: step.agent,
                    description: step.description,
                    status: TASK_STATUS_PENDING.to_string(),
                    result: None,
                    execution_order: index as i64,
                    created_at: now,
                    completed_at: None,
                };
                record.id = storage.insert_subtask(&record)?;
                created.push(record);
            }
            Ok(created)
        })
        .await?;

        let mut outputs: Vec<(String, String)> = Vec::with_capacity(subtasks.len());
        for index in 0..subtasks.len() {
            let agent = self
                .agents
                .get(&subtasks[index].agent_name)
                .or_else(|| self.agents.get(FALLBACK_AGENT))
                .ok_or_else(|| anyhow!("no agent available for subtask"))?;
            subtasks[index].status = TASK_STATUS_IN_PROGRESS.to_string();
            self.save_subtask(&subtasks[index]).await?;

            let messages = [
                ChatMessage::system(agent.system_prompt),
                ChatMessage::user(step_prompt(prompt, &subtasks[index].description, &outputs)),
            ];
            match self.llm.complete(settings, &messages).await {
                Ok(response) => {
                    let subtask = &mut subtasks[index];
                    subtask.status = TASK_STATUS_COMPLETED.to_string();
                    subtask.completed_at = Some(now_ts());
                    subtask.result = Some(json!({
                        "content": response.content,
                        "model": response.model,
                    }));
                    self.save_subtask(subtask).await?;
                    outputs.push((agent.name.to_string(), response.content));
                }
                Err(err) => {
                    let subtask = &mut subtasks[index];
                    subtask.status = TASK_STATUS_FAILED.to_string();
                    subtask.completed_at = Some(now_ts());
                    subtask.result = Some(json!({ "error": err.to_string() }));
                    self.save_subtask(subtask).await?;
                    return Err(anyhow!(
                        "subtask {} ({}) failed: {err}",
                        index + 1,
                        agent.name
                    ));
                }
            }
        }

        let compiler = self
            .agents
            .get(ORCHESTRATOR)
            .ok_or_else(|| anyhow!("orchestrator agent missing"))?;
        let messages = [
            ChatMessage::system(compiler.system_prompt),
            ChatMessage::user(compile_prompt(prompt, &outputs)),
        ];
        let compiled = self.llm.complete(settings, &messages).await?;
        let steps: Vec<Value> = subtasks
            .iter()
            .zip(outputs.iter())
            .map(|(subtask, (agent, content))| {
                json!({
                    "subtask_id": subtask.id,
                    "agent": agent,
                    "description": subtask.description,
                    "content": content,
                })
            })
            .collect();
        Ok(json!({
            "agent": ORCHESTRATOR,
            "content": compiled.content,
            "model": compiled.model,
            "mocked": compiled.mocked,
            "steps": steps,
        }))
    }

    async fn plan(&self, settings: &LlmSettings, prompt: &str) -> Vec<PlanStep> {
        let messages = [ChatMessage::system(PLANNER_PROMPT), ChatMessage::user(prompt)];
        let steps = match self.llm.complete(settings, &messages).await {
            Ok(response) => parse_plan(&response.content, &self.agents),
            Err(err) => {
                warn!("task planning failed, using single step: {err}");
                Vec::new()
            }
        };
        if steps.is_empty() {
            return vec![PlanStep {
                agent: FALLBACK_AGENT.to_string(),
                description: prompt.to_string(),
            }];
        }
        steps
    }

    async fn save_subtask(&self, record: &SubTaskRecord) -> Result<()> {
        let record = record.clone();
        run_storage(&self.storage, move |storage| storage.update_subtask(&record)).await
    }
}

pub fn task_prompt(task: &TaskRecord) -> String {
    [task.query.as_deref(), task.description.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| task.title.trim())
        .to_string()
}

/// Extracts `[{agent, description}]` from a planner reply; unknown agents are dropped.
pub fn parse_plan(reply: &str, agents: &AgentRegistry) -> Vec<PlanStep> {
    let (Some(start), Some(end)) = (reply.find('['), reply.rfind(']')) else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&reply[start..=end]) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item
                .get("agent")
                .or_else(|| item.get("agent_type"))
                .and_then(Value::as_str)?;
            let agent = agents.get(name)?;
            if agent.name == ORCHESTRATOR {
                return None;
            }
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())?;
            Some(PlanStep {
                agent: agent.name.to_string(),
                description: description.to_string(),
            })
        })
        .take(MAX_PLAN_STEPS)
        .collect()
}

fn step_prompt(request: &str, description: &str, previous: &[(String, String)]) -> String {
    let mut text = format!("Step: {description}\n\nOriginal request: {request}");
    if !previous.is_empty() {
        text.push_str("\n\nPrevious results:");
        for (agent, content) in previous {
            text.push_str(&format!(
                "\n- {agent}: {}",
                truncate_text(content, PREVIOUS_RESULT_CHARS)
            ));
        }
    }
    text
}

fn compile_prompt(request: &str, outputs: &[(String, String)]) -> String {
    let mut text = format!("Original request: {request}\n\nResults:");
    for (agent, content) in outputs {
        text.push_str(&format!("\n\n### {agent}\n{content}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parsing_keeps_known_agents_only() {
        let agents = AgentRegistry::new();
        let reply = r#"Here is the plan:
```json
[
  {"agent": "research", "description": "Find competitors"},
  {"agent_type": "content", "description": "Write the post"},
  {"agent": "time_travel", "description": "ignored"},
  {"agent": "orchestrator", "description": "ignored too"},
  {"agent": "analysis", "description": "  "}
]
```"#;
        let plan = parse_plan(reply, &agents);
        assert_eq!(
            plan,
            vec![
                PlanStep {
                    agent: "research".to_string(),
                    description: "Find competitors".to_string(),
                },
                PlanStep {
                    agent: "content".to_string(),
                    description: "Write the post".to_string(),
                },
            ]
        );
    }

    #[test]
    fn plan_parsing_caps_steps_and_tolerates_noise() {
        let agents = AgentRegistry::new();
        let items: Vec<Value> = (0..8)
            .map(|i| json!({"agent": "research", "description": format!("step {i}")}))
            .collect();
        let reply = serde_json::to_string(&items).unwrap();
        assert_eq!(parse_plan(&reply, &agents).len(), MAX_PLAN_STEPS);
        assert!(parse_plan("no json here", &agents).is_empty());
        assert!(parse_plan("] backwards [", &agents).is_empty());
    }

    #[test]
    fn step_prompt_includes_previous_results() {
        let text = step_prompt(
            "launch plan",
            "draft copy",
            &[("research".to_string(), "market is growing".to_string())],
        );
        assert!(text.starts_with("Step: draft copy"));
        assert!(text.contains("- research: market is growing"));
    }
}
