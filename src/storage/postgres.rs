// Postgres storage: pooled tokio-postgres clients driven from the synchronous storage trait.
use crate::storage::{
    escape_like, json_from_str, json_to_string, parse_string_list, string_list_to_json,
    AgentMemoryRecord, AgentTaskStats, FeedbackRecord, IntegrationRecord, ProjectRecord,
    StorageBackend, SubTaskRecord, TaskOutcome, TaskQuery, TaskRecord, TaskStats, UserRecord,
    UserSettingsRecord,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::warn;

const USER_COLUMNS: &str = "id, username, email, full_name, password_hash, role, subscription_tier, subscription_status, \
     is_active, is_verified, created_at, updated_at, last_login_at";
const TASK_COLUMNS: &str = "id, user_id, project_id, title, description, query, task_type, agent_name, status, priority, \
     job_id, queued_at, started_at, completed_at, execution_time, result, output_files, error, created_at, updated_at";
const PROJECT_COLUMNS: &str = "p.id, p.owner_id, p.name, p.description, p.status, \
     (SELECT COUNT(*) FROM tasks t WHERE t.project_id = p.id), p.created_at, p.updated_at";
const SUBTASK_COLUMNS: &str =
    "id, task_id, agent_name, description, status, result, execution_order, created_at, completed_at";
const INTEGRATION_COLUMNS: &str =
    "id, user_id, integration_type, api_key, config, is_active, created_at, updated_at";
const MEMORY_COLUMNS: &str = "id, agent_name, memory_type, content, context_tags, relevance_score, access_count, \
     created_at, accessed_at";
const FEEDBACK_COLUMNS: &str = "id, user_id, task_id, rating, comment, feedback_type, created_at";
const SETTINGS_COLUMNS: &str = "user_id, llm_provider, llm_model, llm_api_key, llm_api_base, theme, language, timezone, \
     email_notifications, task_completion_notifications, project_updates_notifications, auto_save_interval, \
     max_concurrent_tasks, created_at, updated_at";

pub struct PostgresStorage {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    storage: &'a PostgresStorage,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.storage.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self
            .storage
            .block_on(self.client.execute(query, params))??)
    }

    fn query(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.storage.block_on(self.client.query(query, params))??)
    }

    fn query_one(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        Ok(self
            .storage
            .block_on(self.client.query_one(query, params))??)
    }

    fn query_opt(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        Ok(self
            .storage
            .block_on(self.client.query_opt(query, params))??)
    }

    fn transaction<'a>(&'a mut self) -> Result<PgTx<'a>> {
        let tx = self.storage.block_on(self.client.transaction())??;
        Ok(PgTx {
            storage: self.storage,
            tx,
        })
    }
}

struct PgTx<'a> {
    storage: &'a PostgresStorage,
    tx: deadpool_postgres::Transaction<'a>,
}

impl PgTx<'_> {
    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.storage.block_on(self.tx.execute(query, params))??)
    }

    fn query(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.storage.block_on(self.tx.query(query, params))??)
    }

    fn commit(self) -> Result<()> {
        self.storage.block_on(self.tx.commit())??;
        Ok(())
    }
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager).max_size(pool_size.max(1)).build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            storage: self,
            client,
        })
    }

    fn map_user(row: &Row) -> UserRecord {
        UserRecord {
            id: row.get(0),
            username: row.get(1),
            email: row.get(2),
            full_name: row.get(3),
            password_hash: row.get(4),
            role: row.get(5),
            subscription_tier: row.get(6),
            subscription_status: row.get(7),
            is_active: row.get(8),
            is_verified: row.get(9),
            created_at: row.get(10),
            updated_at: row.get(11),
            last_login_at: row.get(12),
        }
    }

    fn map_task(row: &Row) -> TaskRecord {
        TaskRecord {
            id: row.get(0),
            user_id: row.get(1),
            project_id: row.get(2),
            title: row.get(3),
            description: row.get(4),
            query: row.get(5),
            task_type: row.get(6),
            agent_name: row.get(7),
            status: row.get(8),
            priority: row.get(9),
            job_id: row.get(10),
            queued_at: row.get(11),
            started_at: row.get(12),
            completed_at: row.get(13),
            execution_time: row.get(14),
            result: json_from_str(row.get(15)),
            output_files: parse_string_list(row.get(16)),
            error: row.get(17),
            created_at: row.get(18),
            updated_at: row.get(19),
        }
    }

    fn map_project(row: &Row) -> ProjectRecord {
        ProjectRecord {
            id: row.get(0),
            owner_id: row.get(1),
            name: row.get(2),
            description: row.get(3),
            status: row.get(4),
            task_count: row.get(5),
            created_at: row.get(6),
            updated_at: row.get(7),
        }
    }

    fn map_subtask(row: &Row) -> SubTaskRecord {
        SubTaskRecord {
            id: row.get(0),
            task_id: row.get(1),
            agent_name: row.get(2),
            description: row.get(3),
            status: row.get(4),
            result: json_from_str(row.get(5)),
            execution_order: row.get(6),
            created_at: row.get(7),
            completed_at: row.get(8),
        }
    }

    fn map_integration(row: &Row) -> IntegrationRecord {
        IntegrationRecord {
            id: row.get(0),
            user_id: row.get(1),
            integration_type: row.get(2),
            api_key: row.get(3),
            config: json_from_str(row.get(4)).unwrap_or_else(|| serde_json::json!({})),
            is_active: row.get(5),
            created_at: row.get(6),
            updated_at: row.get(7),
        }
    }

    fn map_memory(row: &Row) -> AgentMemoryRecord {
        AgentMemoryRecord {
            id: row.get(0),
            agent_name: row.get(1),
            memory_type: row.get(2),
            content: json_from_str(row.get(3)).unwrap_or(serde_json::Value::Null),
            context_tags: parse_string_list(row.get(4)),
            relevance_score: row.get(5),
            access_count: row.get(6),
            created_at: row.get(7),
            accessed_at: row.get(8),
        }
    }

    fn map_feedback(row: &Row) -> FeedbackRecord {
        FeedbackRecord {
            id: row.get(0),
            user_id: row.get(1),
            task_id: row.get(2),
            rating: row.get(3),
            comment: row.get(4),
            feedback_type: row.get(5),
            created_at: row.get(6),
        }
    }

    fn map_settings(row: &Row) -> UserSettingsRecord {
        UserSettingsRecord {
            user_id: row.get(0),
            llm_provider: row.get(1),
            llm_model: row.get(2),
            llm_api_key: row.get(3),
            llm_api_base: row.get(4),
            theme: row.get(5),
            language: row.get(6),
            timezone: row.get(7),
            email_notifications: row.get(8),
            task_completion_notifications: row.get(9),
            project_updates_notifications: row.get(10),
            auto_save_interval: row.get(11),
            max_concurrent_tasks: row.get(12),
            created_at: row.get(13),
            updated_at: row.get(14),
        }
    }

    fn get_user_where(&self, column: &str, value: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let cleaned = value.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER({column}) = LOWER($1)"),
            &[&cleaned],
        )?;
        Ok(row.as_ref().map(Self::map_user))
    }

    fn query_with_params(
        &self,
        sql: &str,
        params: &[Box<dyn ToSql + Sync>],
    ) -> Result<Vec<Row>> {
        let mut conn = self.conn()?;
        let params_ref: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|value| value.as_ref()).collect();
        conn.query(sql, &params_ref)
    }

    fn result_to_text(value: &Option<serde_json::Value>) -> Option<String> {
        value.as_ref().map(json_to_string)
    }
}

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut conn = match self.conn() {
                Ok(conn) => conn,
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    warn!("postgres not ready (attempt {attempts}): {err}");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            conn.batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                  id BIGSERIAL PRIMARY KEY,
                  username TEXT NOT NULL UNIQUE,
                  email TEXT NOT NULL UNIQUE,
                  full_name TEXT,
                  password_hash TEXT NOT NULL,
                  role TEXT NOT NULL DEFAULT 'user',
                  subscription_tier TEXT NOT NULL DEFAULT 'free',
                  subscription_status TEXT NOT NULL DEFAULT 'active',
                  is_active BOOLEAN NOT NULL DEFAULT TRUE,
                  is_verified BOOLEAN NOT NULL DEFAULT FALSE,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL,
                  last_login_at DOUBLE PRECISION
                );
                CREATE TABLE IF NOT EXISTS projects (
                  id BIGSERIAL PRIMARY KEY,
                  owner_id BIGINT NOT NULL,
                  name TEXT NOT NULL,
                  description TEXT,
                  status TEXT NOT NULL DEFAULT 'active',
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects (owner_id, created_at);
                CREATE TABLE IF NOT EXISTS tasks (
                  id BIGSERIAL PRIMARY KEY,
                  user_id BIGINT NOT NULL,
                  project_id BIGINT,
                  title TEXT NOT NULL,
                  description TEXT,
                  query TEXT,
                  task_type TEXT,
                  agent_name TEXT,
                  status TEXT NOT NULL DEFAULT 'pending',
                  priority TEXT NOT NULL DEFAULT 'medium',
                  job_id TEXT,
                  queued_at DOUBLE PRECISION,
                  started_at DOUBLE PRECISION,
                  completed_at DOUBLE PRECISION,
                  execution_time DOUBLE PRECISION,
                  result TEXT,
                  output_files TEXT,
                  error TEXT,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks (project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, completed_at);
                CREATE TABLE IF NOT EXISTS task_executions (
                  id BIGSERIAL PRIMARY KEY,
                  user_id BIGINT NOT NULL,
                  task_id BIGINT NOT NULL,
                  queued_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_task_executions_user
                  ON task_executions (user_id, queued_at);
                CREATE TABLE IF NOT EXISTS subtasks (
                  id BIGSERIAL PRIMARY KEY,
                  task_id BIGINT NOT NULL,
                  agent_name TEXT NOT NULL,
                  description TEXT NOT NULL,
                  status TEXT NOT NULL DEFAULT 'pending',
                  result TEXT,
                  execution_order BIGINT NOT NULL DEFAULT 0,
                  created_at DOUBLE PRECISION NOT NULL,
                  completed_at DOUBLE PRECISION
                );
                CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks (task_id, execution_order);
                CREATE TABLE IF NOT EXISTS integrations (
                  id BIGSERIAL PRIMARY KEY,
                  user_id BIGINT NOT NULL,
                  integration_type TEXT NOT NULL,
                  api_key TEXT,
                  config TEXT,
                  is_active BOOLEAN NOT NULL DEFAULT TRUE,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL,
                  UNIQUE (user_id, integration_type)
                );
                CREATE TABLE IF NOT EXISTS agent_memory (
                  id BIGSERIAL PRIMARY KEY,
                  agent_name TEXT NOT NULL,
                  memory_type TEXT NOT NULL,
                  content TEXT NOT NULL,
                  context_tags TEXT,
                  relevance_score DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                  access_count BIGINT NOT NULL DEFAULT 0,
                  created_at DOUBLE PRECISION NOT NULL,
                  accessed_at DOUBLE PRECISION
                );
                CREATE INDEX IF NOT EXISTS idx_agent_memory_agent
                  ON agent_memory (agent_name, memory_type, relevance_score);
                CREATE TABLE IF NOT EXISTS feedback (
                  id BIGSERIAL PRIMARY KEY,
                  user_id BIGINT NOT NULL,
                  task_id BIGINT NOT NULL,
                  rating BIGINT NOT NULL,
                  comment TEXT,
                  feedback_type TEXT NOT NULL DEFAULT 'general',
                  created_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_feedback_task ON feedback (task_id);
                CREATE INDEX IF NOT EXISTS idx_feedback_user ON feedback (user_id, created_at);
                CREATE TABLE IF NOT EXISTS user_settings (
                  user_id BIGINT PRIMARY KEY,
                  llm_provider TEXT NOT NULL,
                  llm_model TEXT NOT NULL,
                  llm_api_key TEXT,
                  llm_api_base TEXT,
                  theme TEXT NOT NULL,
                  language TEXT NOT NULL,
                  timezone TEXT NOT NULL,
                  email_notifications BOOLEAN NOT NULL,
                  task_completion_notifications BOOLEAN NOT NULL,
                  project_updates_notifications BOOLEAN NOT NULL,
                  auto_save_interval BIGINT NOT NULL,
                  max_concurrent_tasks BIGINT NOT NULL,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL
                );
                "#,
            )?;
            break;
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn insert_user(&self, record: &UserRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO users (username, email, full_name, password_hash, role, subscription_tier, subscription_status, \
             is_active, is_verified, created_at, updated_at, last_login_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING id",
            &[
                &record.username,
                &record.email,
                &record.full_name,
                &record.password_hash,
                &record.role,
                &record.subscription_tier,
                &record.subscription_status,
                &record.is_active,
                &record.is_verified,
                &record.created_at,
                &record.updated_at,
                &record.last_login_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn update_user(&self, record: &UserRecord) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE users SET username = $1, email = $2, full_name = $3, password_hash = $4, role = $5, \
             subscription_tier = $6, subscription_status = $7, is_active = $8, is_verified = $9, updated_at = $10, \
             last_login_at = $11 WHERE id = $12",
            &[
                &record.username,
                &record.email,
                &record.full_name,
                &record.password_hash,
                &record.role,
                &record.subscription_tier,
                &record.subscription_status,
                &record.is_active,
                &record.is_verified,
                &record.updated_at,
                &record.last_login_at,
                &record.id,
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"),
            &[&id],
        )?;
        Ok(row.as_ref().map(Self::map_user))
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        self.get_user_where("username", username)
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        self.get_user_where("email", email)
    }

    fn list_users(&self, offset: i64, limit: i64) -> Result<(Vec<UserRecord>, i64)> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let total: i64 = conn.query_one("SELECT COUNT(*) FROM users", &[])?.get(0);
        let rows = conn.query(
            &format!("SELECT {USER_COLUMNS} FROM users ORDER BY id ASC LIMIT $1 OFFSET $2"),
            &[&limit.max(1), &offset.max(0)],
        )?;
        Ok((rows.iter().map(Self::map_user).collect(), total))
    }

    fn insert_project(&self, record: &ProjectRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO projects (owner_id, name, description, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            &[
                &record.owner_id,
                &record.name,
                &record.description,
                &record.status,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn update_project(&self, record: &ProjectRecord) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE projects SET name = $1, description = $2, status = $3, updated_at = $4 WHERE id = $5 AND owner_id = $6",
            &[
                &record.name,
                &record.description,
                &record.status,
                &record.updated_at,
                &record.id,
                &record.owner_id,
            ],
        )?;
        Ok(())
    }

    fn get_project(&self, owner_id: i64, id: i64) -> Result<Option<ProjectRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = $1 AND p.owner_id = $2"),
            &[&id, &owner_id],
        )?;
        Ok(row.as_ref().map(Self::map_project))
    }

    fn list_projects(&self, owner_id: i64, offset: i64, limit: i64) -> Result<Vec<ProjectRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!(
                "SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.owner_id = $1 \
                 ORDER BY p.created_at DESC, p.id DESC LIMIT $2 OFFSET $3"
            ),
            &[&owner_id, &limit.max(1), &offset.max(0)],
        )?;
        Ok(rows.iter().map(Self::map_project).collect())
    }

    fn delete_project(&self, owner_id: i64, id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        let affected = tx.execute(
            "DELETE FROM projects WHERE id = $1 AND owner_id = $2",
            &[&id, &owner_id],
        )?;
        if affected > 0 {
            tx.execute(
                "UPDATE tasks SET project_id = NULL, updated_at = $1 WHERE project_id = $2 AND user_id = $3",
                &[&Self::now_ts(), &id, &owner_id],
            )?;
        }
        tx.commit()?;
        Ok(affected as i64)
    }

    fn count_projects(&self, owner_id: Option<i64>) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = match owner_id {
            Some(owner_id) => conn.query_one(
                "SELECT COUNT(*) FROM projects WHERE owner_id = $1",
                &[&owner_id],
            )?,
            None => conn.query_one("SELECT COUNT(*) FROM projects", &[])?,
        };
        Ok(row.get(0))
    }

    fn insert_task(&self, record: &TaskRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let result = Self::result_to_text(&record.result);
        let output_files = string_list_to_json(&record.output_files);
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO tasks (user_id, project_id, title, description, query, task_type, agent_name, status, priority, \
             job_id, queued_at, started_at, completed_at, execution_time, result, output_files, error, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) RETURNING id",
            &[
                &record.user_id,
                &record.project_id,
                &record.title,
                &record.description,
                &record.query,
                &record.task_type,
                &record.agent_name,
                &record.status,
                &record.priority,
                &record.job_id,
                &record.queued_at,
                &record.started_at,
                &record.completed_at,
                &record.execution_time,
                &result,
                &output_files,
                &record.error,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn update_task(&self, record: &TaskRecord) -> Result<()> {
        self.ensure_initialized()?;
        let result = Self::result_to_text(&record.result);
        let output_files = string_list_to_json(&record.output_files);
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET project_id = $1, title = $2, description = $3, query = $4, task_type = $5, agent_name = $6, \
             status = $7, priority = $8, job_id = $9, queued_at = $10, started_at = $11, completed_at = $12, \
             execution_time = $13, result = $14, output_files = $15, error = $16, updated_at = $17 WHERE id = $18",
            &[
                &record.project_id,
                &record.title,
                &record.description,
                &record.query,
                &record.task_type,
                &record.agent_name,
                &record.status,
                &record.priority,
                &record.job_id,
                &record.queued_at,
                &record.started_at,
                &record.completed_at,
                &record.execution_time,
                &result,
                &output_files,
                &record.error,
                &record.updated_at,
                &record.id,
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"),
            &[&id],
        )?;
        Ok(row.as_ref().map(Self::map_task))
    }

    fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        self.ensure_initialized()?;
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1");
        let mut params: Vec<Box<dyn ToSql + Sync>> = vec![Box::new(query.user_id)];
        if let Some(status) = query.status.as_deref().filter(|value| !value.is_empty()) {
            params.push(Box::new(status.to_string()));
            sql.push_str(&format!(" AND status = ${}", params.len()));
        }
        if let Some(project_id) = query.project_id {
            params.push(Box::new(project_id));
            sql.push_str(&format!(" AND project_id = ${}", params.len()));
        }
        if let Some(agent) = query.agent_name.as_deref().filter(|value| !value.is_empty()) {
            params.push(Box::new(agent.to_string()));
            sql.push_str(&format!(" AND agent_name = ${}", params.len()));
        }
        if let Some(search) = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            params.push(Box::new(escape_like(search)));
            let index = params.len();
            sql.push_str(&format!(
                " AND (title ILIKE ${index} OR description ILIKE ${index} OR query ILIKE ${index})"
            ));
        }
        params.push(Box::new(query.limit.max(1)));
        let limit_index = params.len();
        params.push(Box::new(query.offset.max(0)));
        let offset_index = params.len();
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT ${limit_index} OFFSET ${offset_index}"
        ));
        let rows = self.query_with_params(&sql, &params)?;
        Ok(rows.iter().map(Self::map_task).collect())
    }

    fn delete_task(&self, user_id: i64, id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        let affected = tx.execute(
            "DELETE FROM tasks WHERE id = $1 AND user_id = $2",
            &[&id, &user_id],
        )?;
        if affected > 0 {
            tx.execute("DELETE FROM subtasks WHERE task_id = $1", &[&id])?;
            tx.execute("DELETE FROM feedback WHERE task_id = $1", &[&id])?;
        }
        tx.commit()?;
        Ok(affected as i64)
    }

    fn task_stats(&self, user_id: Option<i64>) -> Result<TaskStats> {
        self.ensure_initialized()?;
        let mut sql = String::from(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0)::BIGINT, \
             COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0)::BIGINT, \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)::BIGINT, \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)::BIGINT, \
             AVG(CASE WHEN status = 'completed' THEN execution_time END) FROM tasks",
        );
        let mut params: Vec<Box<dyn ToSql + Sync>> = Vec::new();
        if let Some(user_id) = user_id {
            params.push(Box::new(user_id));
            sql.push_str(" WHERE user_id = $1");
        }
        let rows = self.query_with_params(&sql, &params)?;
        let Some(row) = rows.first() else {
            return Ok(TaskStats::default());
        };
        Ok(TaskStats {
            total: row.get(0),
            pending: row.get(1),
            in_progress: row.get(2),
            completed: row.get(3),
            failed: row.get(4),
            avg_execution_time: row.get(5),
        })
    }

    fn agent_task_stats(&self, user_id: Option<i64>) -> Result<Vec<AgentTaskStats>> {
        self.ensure_initialized()?;
        let mut sql = String::from(
            "SELECT COALESCE(agent_name, task_type, 'unassigned') AS agent, COUNT(*), \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)::BIGINT, \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)::BIGINT, \
             AVG(CASE WHEN status = 'completed' THEN execution_time END) FROM tasks",
        );
        let mut params: Vec<Box<dyn ToSql + Sync>> = Vec::new();
        if let Some(user_id) = user_id {
            params.push(Box::new(user_id));
            sql.push_str(" WHERE user_id = $1");
        }
        sql.push_str(" GROUP BY 1 ORDER BY 1");
        let rows = self.query_with_params(&sql, &params)?;
        Ok(rows
            .iter()
            .map(|row| AgentTaskStats {
                agent_name: row.get(0),
                total: row.get(1),
                completed: row.get(2),
                failed: row.get(3),
                avg_execution_time: row.get(4),
            })
            .collect())
    }

    fn count_tasks_created_since(&self, user_id: i64, since: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "SELECT COUNT(*) FROM tasks WHERE user_id = $1 AND created_at >= $2",
            &[&user_id, &since],
        )?;
        Ok(row.get(0))
    }

    fn record_task_execution(&self, user_id: i64, task_id: i64, queued_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_executions (user_id, task_id, queued_at) VALUES ($1, $2, $3)",
            &[&user_id, &task_id, &queued_at],
        )?;
        Ok(())
    }

    fn count_executions_since(&self, user_id: i64, since: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "SELECT COUNT(*) FROM task_executions WHERE user_id = $1 AND queued_at >= $2",
            &[&user_id, &since],
        )?;
        Ok(row.get(0))
    }

    fn mark_task_started(
        &self,
        id: i64,
        job_id: &str,
        started_at: f64,
        agent_name: &str,
    ) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at = $1, agent_name = COALESCE(agent_name, $2), \
             updated_at = $1 WHERE id = $3 AND job_id = $4",
            &[&started_at, &agent_name, &id, &job_id],
        )?;
        Ok(affected > 0)
    }

    fn finish_task(&self, outcome: &TaskOutcome) -> Result<bool> {
        self.ensure_initialized()?;
        let result = Self::result_to_text(&outcome.result);
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE tasks SET status = $1, result = $2, error = $3, execution_time = $4, completed_at = $5, \
             updated_at = $5 WHERE id = $6 AND job_id = $7",
            &[
                &outcome.status,
                &result,
                &outcome.error,
                &outcome.execution_time,
                &outcome.completed_at,
                &outcome.task_id,
                &outcome.job_id,
            ],
        )?;
        Ok(affected > 0)
    }

    fn fail_interrupted_tasks(&self, message: &str, now: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let subtask_result = json_to_string(&serde_json::json!({ "error": message }));
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        let interrupted: Vec<i64> = tx
            .query(
                "SELECT id FROM tasks WHERE status = 'in_progress' \
                 OR (status = 'pending' AND job_id IS NOT NULL)",
                &[],
            )?
            .iter()
            .map(|row| row.get(0))
            .collect();
        if interrupted.is_empty() {
            tx.commit()?;
            return Ok(0);
        }
        tx.execute(
            "UPDATE subtasks SET status = 'failed', result = $1, completed_at = $2 \
             WHERE status IN ('pending', 'in_progress') AND task_id = ANY($3)",
            &[&subtask_result, &now, &interrupted],
        )?;
        let affected = tx.execute(
            "UPDATE tasks SET status = 'failed', error = $1, completed_at = $2, updated_at = $2 \
             WHERE id = ANY($3)",
            &[&message, &now, &interrupted],
        )?;
        tx.commit()?;
        Ok(affected as i64)
    }

    fn delete_finished_tasks_before(&self, cutoff: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        let expired: Vec<i64> = tx
            .query(
                "SELECT id FROM tasks WHERE status IN ('completed', 'failed') \
                 AND completed_at IS NOT NULL AND completed_at < $1",
                &[&cutoff],
            )?
            .iter()
            .map(|row| row.get(0))
            .collect();
        if expired.is_empty() {
            tx.commit()?;
            return Ok(0);
        }
        tx.execute("DELETE FROM subtasks WHERE task_id = ANY($1)", &[&expired])?;
        tx.execute("DELETE FROM feedback WHERE task_id = ANY($1)", &[&expired])?;
        let affected = tx.execute("DELETE FROM tasks WHERE id = ANY($1)", &[&expired])?;
        tx.commit()?;
        Ok(affected as i64)
    }

    fn insert_subtask(&self, record: &SubTaskRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let result = Self::result_to_text(&record.result);
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO subtasks (task_id, agent_name, description, status, result, execution_order, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            &[
                &record.task_id,
                &record.agent_name,
                &record.description,
                &record.status,
                &result,
                &record.execution_order,
                &record.created_at,
                &record.completed_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn update_subtask(&self, record: &SubTaskRecord) -> Result<()> {
        self.ensure_initialized()?;
        let result = Self::result_to_text(&record.result);
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE subtasks SET status = $1, result = $2, completed_at = $3 WHERE id = $4",
            &[&record.status, &result, &record.completed_at, &record.id],
        )?;
        Ok(())
    }

    fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubTaskRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!(
                "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = $1 ORDER BY execution_order ASC, id ASC"
            ),
            &[&task_id],
        )?;
        Ok(rows.iter().map(Self::map_subtask).collect())
    }

    fn fail_open_subtasks(&self, task_id: i64, message: &str, now: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let result = json_to_string(&serde_json::json!({ "error": message }));
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE subtasks SET status = 'failed', result = $1, completed_at = $2 \
             WHERE task_id = $3 AND status IN ('pending', 'in_progress')",
            &[&result, &now, &task_id],
        )?;
        Ok(affected as i64)
    }

    fn insert_integration(&self, record: &IntegrationRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let config = json_to_string(&record.config);
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO integrations (user_id, integration_type, api_key, config, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
            &[
                &record.user_id,
                &record.integration_type,
                &record.api_key,
                &config,
                &record.is_active,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn update_integration(&self, record: &IntegrationRecord) -> Result<()> {
        self.ensure_initialized()?;
        let config = json_to_string(&record.config);
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE integrations SET api_key = $1, config = $2, is_active = $3, updated_at = $4 \
             WHERE id = $5 AND user_id = $6",
            &[
                &record.api_key,
                &config,
                &record.is_active,
                &record.updated_at,
                &record.id,
                &record.user_id,
            ],
        )?;
        Ok(())
    }

    fn get_integration(&self, user_id: i64, id: i64) -> Result<Option<IntegrationRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = $1 AND user_id = $2"),
            &[&id, &user_id],
        )?;
        Ok(row.as_ref().map(Self::map_integration))
    }

    fn get_integration_by_type(
        &self,
        user_id: i64,
        integration_type: &str,
    ) -> Result<Option<IntegrationRecord>> {
        self.ensure_initialized()?;
        let cleaned = integration_type.trim();
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE user_id = $1 AND integration_type = $2"
            ),
            &[&user_id, &cleaned],
        )?;
        Ok(row.as_ref().map(Self::map_integration))
    }

    fn list_integrations(&self, user_id: i64) -> Result<Vec<IntegrationRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!("SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE user_id = $1 ORDER BY id ASC"),
            &[&user_id],
        )?;
        Ok(rows.iter().map(Self::map_integration).collect())
    }

    fn delete_integration(&self, user_id: i64, id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM integrations WHERE id = $1 AND user_id = $2",
            &[&id, &user_id],
        )?;
        Ok(affected as i64)
    }

    fn insert_agent_memory(&self, record: &AgentMemoryRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let content = json_to_string(&record.content);
        let tags = string_list_to_json(&record.context_tags);
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO agent_memory (agent_name, memory_type, content, context_tags, relevance_score, access_count, \
             created_at, accessed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            &[
                &record.agent_name,
                &record.memory_type,
                &content,
                &tags,
                &record.relevance_score,
                &record.access_count,
                &record.created_at,
                &record.accessed_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn list_agent_memory(
        &self,
        agent_name: &str,
        memory_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AgentMemoryRecord>> {
        self.ensure_initialized()?;
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM agent_memory WHERE agent_name = $1");
        let mut params: Vec<Box<dyn ToSql + Sync>> =
            vec![Box::new(agent_name.trim().to_string())];
        if let Some(memory_type) = memory_type.map(str::trim).filter(|value| !value.is_empty()) {
            params.push(Box::new(memory_type.to_string()));
            sql.push_str(&format!(" AND memory_type = ${}", params.len()));
        }
        params.push(Box::new(limit.max(1)));
        sql.push_str(&format!(
            " ORDER BY relevance_score DESC, created_at DESC LIMIT ${}",
            params.len()
        ));
        let mut records: Vec<AgentMemoryRecord> = self
            .query_with_params(&sql, &params)?
            .iter()
            .map(Self::map_memory)
            .collect();
        if records.is_empty() {
            return Ok(records);
        }
        let now = Self::now_ts();
        let ids: Vec<i64> = records.iter().map(|item| item.id).collect();
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE agent_memory SET access_count = access_count + 1, accessed_at = $1 WHERE id = ANY($2)",
            &[&now, &ids],
        )?;
        for record in records.iter_mut() {
            record.access_count += 1;
            record.accessed_at = Some(now);
        }
        Ok(records)
    }

    fn list_agent_memory_since(&self, since: f64) -> Result<Vec<AgentMemoryRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!(
                "SELECT {MEMORY_COLUMNS} FROM agent_memory WHERE created_at >= $1 ORDER BY created_at ASC, id ASC"
            ),
            &[&since],
        )?;
        Ok(rows.iter().map(Self::map_memory).collect())
    }

    fn update_memory_relevance(&self, id: i64, relevance_score: f64) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE agent_memory SET relevance_score = $1 WHERE id = $2",
            &[&relevance_score, &id],
        )?;
        Ok(())
    }

    fn delete_stale_agent_memory(&self, cutoff: f64, min_relevance: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM agent_memory WHERE created_at < $1 AND relevance_score < $2",
            &[&cutoff, &min_relevance],
        )?;
        Ok(affected as i64)
    }

    fn insert_feedback(&self, record: &FeedbackRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO feedback (user_id, task_id, rating, comment, feedback_type, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            &[
                &record.user_id,
                &record.task_id,
                &record.rating,
                &record.comment,
                &record.feedback_type,
                &record.created_at,
            ],
        )?;
        Ok(row.get(0))
    }

    fn list_feedback_by_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<FeedbackRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE user_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
            ),
            &[&user_id, &limit.max(1), &offset.max(0)],
        )?;
        Ok(rows.iter().map(Self::map_feedback).collect())
    }

    fn list_feedback_by_task(&self, task_id: i64) -> Result<Vec<FeedbackRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE task_id = $1 ORDER BY created_at DESC, id DESC"
            ),
            &[&task_id],
        )?;
        Ok(rows.iter().map(Self::map_feedback).collect())
    }

    fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettingsRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {SETTINGS_COLUMNS} FROM user_settings WHERE user_id = $1"),
            &[&user_id],
        )?;
        Ok(row.as_ref().map(Self::map_settings))
    }

    fn upsert_user_settings(&self, record: &UserSettingsRecord) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO user_settings ({SETTINGS_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 ON CONFLICT (user_id) DO UPDATE SET llm_provider = EXCLUDED.llm_provider, \
                 llm_model = EXCLUDED.llm_model, llm_api_key = EXCLUDED.llm_api_key, \
                 llm_api_base = EXCLUDED.llm_api_base, theme = EXCLUDED.theme, language = EXCLUDED.language, \
                 timezone = EXCLUDED.timezone, email_notifications = EXCLUDED.email_notifications, \
                 task_completion_notifications = EXCLUDED.task_completion_notifications, \
                 project_updates_notifications = EXCLUDED.project_updates_notifications, \
                 auto_save_interval = EXCLUDED.auto_save_interval, \
                 max_concurrent_tasks = EXCLUDED.max_concurrent_tasks, updated_at = EXCLUDED.updated_at"
            ),
            &[
                &record.user_id,
                &record.llm_provider,
                &record.llm_model,
                &record.llm_api_key,
                &record.llm_api_base,
                &record.theme,
                &record.language,
                &record.timezone,
                &record.email_notifications,
                &record.task_completion_notifications,
                &record.project_updates_notifications,
                &record.auto_save_interval,
                &record.max_concurrent_tasks,
                &record.created_at,
                &record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn delete_user_settings(&self, user_id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM user_settings WHERE user_id = $1",
            &[&user_id],
        )?;
        Ok(affected as i64)
    }
}
