// Storage module: SQLite/Postgres persistence behind one synchronous trait.

mod postgres;
mod sqlite;

use crate::core::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

pub const TASK_STATUS_PENDING: &str = "pending";
pub const TASK_STATUS_IN_PROGRESS: &str = "in_progress";
pub const TASK_STATUS_COMPLETED: &str = "completed";
pub const TASK_STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub subscription_tier: String,
    pub subscription_status: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_login_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    /// Derived on read; ignored on write.
    pub task_count: i64,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub user_id: i64,
    pub project_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub query: Option<String>,
    pub task_type: Option<String>,
    pub agent_name: Option<String>,
    pub status: String,
    pub priority: String,
    pub job_id: Option<String>,
    pub queued_at: Option<f64>,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub execution_time: Option<f64>,
    pub result: Option<Value>,
    pub output_files: Vec<String>,
    pub error: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Terminal state of one worker run.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub job_id: String,
    pub status: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time: f64,
    pub completed_at: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub user_id: i64,
    pub status: Option<String>,
    pub project_id: Option<i64>,
    pub agent_name: Option<String>,
    pub search: Option<String>,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct SubTaskRecord {
    pub id: i64,
    pub task_id: i64,
    pub agent_name: String,
    pub description: String,
    pub status: String,
    pub result: Option<Value>,
    pub execution_order: i64,
    pub created_at: f64,
    pub completed_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct IntegrationRecord {
    pub id: i64,
    pub user_id: i64,
    pub integration_type: String,
    pub api_key: Option<String>,
    pub config: Value,
    pub is_active: bool,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct AgentMemoryRecord {
    pub id: i64,
    pub agent_name: String,
    pub memory_type: String,
    pub content: Value,
    pub context_tags: Vec<String>,
    pub relevance_score: f64,
    pub access_count: i64,
    pub created_at: f64,
    pub accessed_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FeedbackRecord {
    pub id: i64,
    pub user_id: i64,
    pub task_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    pub feedback_type: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct UserSettingsRecord {
    pub user_id: i64,
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_api_base: Option<String>,
    pub theme: String,
    pub language: String,
    pub timezone: String,
    pub email_notifications: bool,
    pub task_completion_notifications: bool,
    pub project_updates_notifications: bool,
    pub auto_save_interval: i64,
    pub max_concurrent_tasks: i64,
    pub created_at: f64,
    pub updated_at: f64,
}

impl UserSettingsRecord {
    pub fn defaults(user_id: i64, now: f64) -> Self {
        Self {
            user_id,
            llm_provider: "openai".to_string(),
            llm_model: "gpt-3.5-turbo".to_string(),
            llm_api_key: None,
            llm_api_base: None,
            theme: "light".to_string(),
            language: "en".to_string(),
            timezone: "UTC".to_string(),
            email_notifications: true,
            task_completion_notifications: true,
            project_updates_notifications: true,
            auto_save_interval: 30,
            max_concurrent_tasks: 3,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStats {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_execution_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentTaskStats {
    pub agent_name: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_execution_time: Option<f64>,
}

/// Storage backend abstraction shared by the API handlers, the worker pool and maintenance jobs.
/// Rows owned by a user are addressed with `(user_id, id)` so a foreign id reads as missing.
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn insert_user(&self, record: &UserRecord) -> Result<i64>;
    fn update_user(&self, record: &UserRecord) -> Result<()>;
    fn get_user(&self, id: i64) -> Result<Option<UserRecord>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    fn list_users(&self, offset: i64, limit: i64) -> Result<(Vec<UserRecord>, i64)>;

    fn insert_project(&self, record: &ProjectRecord) -> Result<i64>;
    fn update_project(&self, record: &ProjectRecord) -> Result<()>;
    fn get_project(&self, owner_id: i64, id: i64) -> Result<Option<ProjectRecord>>;
    fn list_projects(&self, owner_id: i64, offset: i64, limit: i64) -> Result<Vec<ProjectRecord>>;
    /// Deletes the project and detaches its tasks. Returns the number of deleted projects.
    fn delete_project(&self, owner_id: i64, id: i64) -> Result<i64>;
    fn count_projects(&self, owner_id: Option<i64>) -> Result<i64>;

    fn insert_task(&self, record: &TaskRecord) -> Result<i64>;
    fn update_task(&self, record: &TaskRecord) -> Result<()>;
    fn get_task(&self, id: i64) -> Result<Option<TaskRecord>>;
    fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>>;
    /// Deletes the task with its subtasks and feedback.
    fn delete_task(&self, user_id: i64, id: i64) -> Result<i64>;
    fn task_stats(&self, user_id: Option<i64>) -> Result<TaskStats>;
    fn agent_task_stats(&self, user_id: Option<i64>) -> Result<Vec<AgentTaskStats>>;
    fn count_tasks_created_since(&self, user_id: i64, since: f64) -> Result<i64>;
    /// Appends to the execution log. Log rows outlive the task they reference.
    fn record_task_execution(&self, user_id: i64, task_id: i64, queued_at: f64) -> Result<()>;
    fn count_executions_since(&self, user_id: i64, since: f64) -> Result<i64>;
    /// Moves a queued task to `in_progress`. Only status columns are written, and only while
    /// `job_id` still owns the task. Returns false when it does not.
    fn mark_task_started(
        &self,
        id: i64,
        job_id: &str,
        started_at: f64,
        agent_name: &str,
    ) -> Result<bool>;
    /// Writes the terminal status columns of a run, guarded by `job_id` like `mark_task_started`.
    fn finish_task(&self, outcome: &TaskOutcome) -> Result<bool>;
    /// Fails tasks left queued or running by a previous process, together with their open
    /// subtasks. Returns the number of failed tasks.
    fn fail_interrupted_tasks(&self, message: &str, now: f64) -> Result<i64>;
    /// Removes completed/failed tasks finished before `cutoff`.
    fn delete_finished_tasks_before(&self, cutoff: f64) -> Result<i64>;

    fn insert_subtask(&self, record: &SubTaskRecord) -> Result<i64>;
    fn update_subtask(&self, record: &SubTaskRecord) -> Result<()>;
    fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubTaskRecord>>;
    /// Marks pending and in-progress subtasks failed with `{"error": message}` as result.
    fn fail_open_subtasks(&self, task_id: i64, message: &str, now: f64) -> Result<i64>;

    fn insert_integration(&self, record: &IntegrationRecord) -> Result<i64>;
    fn update_integration(&self, record: &IntegrationRecord) -> Result<()>;
    fn get_integration(&self, user_id: i64, id: i64) -> Result<Option<IntegrationRecord>>;
    fn get_integration_by_type(
        &self,
        user_id: i64,
        integration_type: &str,
    ) -> Result<Option<IntegrationRecord>>;
    fn list_integrations(&self, user_id: i64) -> Result<Vec<IntegrationRecord>>;
    fn delete_integration(&self, user_id: i64, id: i64) -> Result<i64>;

    fn insert_agent_memory(&self, record: &AgentMemoryRecord) -> Result<i64>;
    /// Returns memories ordered by relevance and bumps their access counters.
    fn list_agent_memory(
        &self,
        agent_name: &str,
        memory_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AgentMemoryRecord>>;
    /// Memories created at or after `since`, oldest first. Access counters are left alone.
    fn list_agent_memory_since(&self, since: f64) -> Result<Vec<AgentMemoryRecord>>;
    fn update_memory_relevance(&self, id: i64, relevance_score: f64) -> Result<()>;
    /// Deletes memories created before `cutoff` whose relevance is below `min_relevance`.
    fn delete_stale_agent_memory(&self, cutoff: f64, min_relevance: f64) -> Result<i64>;

    fn insert_feedback(&self, record: &FeedbackRecord) -> Result<i64>;
    fn list_feedback_by_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<FeedbackRecord>>;
    fn list_feedback_by_task(&self, task_id: i64) -> Result<Vec<FeedbackRecord>>;

    fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettingsRecord>>;
    fn upsert_user_settings(&self, record: &UserSettingsRecord) -> Result<()>;
    fn delete_user_settings(&self, user_id: i64) -> Result<i64>;
}

pub(crate) fn string_list_to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn parse_string_list(value: Option<String>) -> Vec<String> {
    let Some(raw) = value else {
        return Vec::new();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
        return items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
    }
    trimmed
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub(crate) fn json_to_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn json_from_str(text: Option<String>) -> Option<Value> {
    let text = text?;
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(&text).ok()
}

pub(crate) fn escape_like(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len() + 2);
    output.push('%');
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            output.push('\\');
        }
        output.push(ch);
    }
    output.push('%');
    output
}

/// Picks the backend. A `postgres://` URL in `database_url` wins over the configured backend name.
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let database_url = config.database_url.trim();
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        return Ok(Arc::new(PostgresStorage::new(
            database_url.to_string(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?));
    }
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => {
            let path = database_url
                .strip_prefix("sqlite://")
                .or_else(|| database_url.strip_prefix("sqlite:"))
                .map(str::to_string)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| config.db_path.trim().to_string());
            Ok(Arc::new(SqliteStorage::new(path)))
        }
        "postgres" | "postgresql" | "pg" => Ok(Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(escape_like("market"), "%market%");
        assert_eq!(escape_like("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn string_list_accepts_json_and_csv() {
        assert_eq!(
            parse_string_list(Some("[\"a\", \" b \"]".to_string())),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            parse_string_list(Some("x, y,,".to_string())),
            vec!["x".to_string(), "y".to_string()]
        );
        assert!(parse_string_list(None).is_empty());
    }
}
