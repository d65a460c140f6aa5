// SQLite storage: one connection per call, schema created lazily on first use.
use crate::storage::{
    escape_like, json_from_str, json_to_string, parse_string_list, string_list_to_json,
    AgentMemoryRecord, AgentTaskStats, FeedbackRecord, IntegrationRecord, ProjectRecord,
    StorageBackend, SubTaskRecord, TaskOutcome, TaskQuery, TaskRecord, TaskStats, UserRecord,
    UserSettingsRecord,
};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

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

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/aigentic.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();
        Ok(conn)
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            full_name: row.get(3)?,
            password_hash: row.get(4)?,
            role: row.get(5)?,
            subscription_tier: row.get(6)?,
            subscription_status: row.get(7)?,
            is_active: row.get::<_, i64>(8)? != 0,
            is_verified: row.get::<_, i64>(9)? != 0,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            last_login_at: row.get(12)?,
        })
    }

    fn map_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
        Ok(TaskRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            project_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            query: row.get(5)?,
            task_type: row.get(6)?,
            agent_name: row.get(7)?,
            status: row.get(8)?,
            priority: row.get(9)?,
            job_id: row.get(10)?,
            queued_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
            execution_time: row.get(14)?,
            result: json_from_str(row.get(15)?),
            output_files: parse_string_list(row.get(16)?),
            error: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    fn map_project(row: &Row<'_>) -> rusqlite::Result<ProjectRecord> {
        Ok(ProjectRecord {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            task_count: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn map_subtask(row: &Row<'_>) -> rusqlite::Result<SubTaskRecord> {
        Ok(SubTaskRecord {
            id: row.get(0)?,
            task_id: row.get(1)?,
            agent_name: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            result: json_from_str(row.get(5)?),
            execution_order: row.get(6)?,
            created_at: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn map_integration(row: &Row<'_>) -> rusqlite::Result<IntegrationRecord> {
        Ok(IntegrationRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            integration_type: row.get(2)?,
            api_key: row.get(3)?,
            config: json_from_str(row.get(4)?).unwrap_or_else(|| serde_json::json!({})),
            is_active: row.get::<_, i64>(5)? != 0,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn map_memory(row: &Row<'_>) -> rusqlite::Result<AgentMemoryRecord> {
        Ok(AgentMemoryRecord {
            id: row.get(0)?,
            agent_name: row.get(1)?,
            memory_type: row.get(2)?,
            content: json_from_str(row.get(3)?).unwrap_or(serde_json::Value::Null),
            context_tags: parse_string_list(row.get(4)?),
            relevance_score: row.get(5)?,
            access_count: row.get(6)?,
            created_at: row.get(7)?,
            accessed_at: row.get(8)?,
        })
    }

    fn map_feedback(row: &Row<'_>) -> rusqlite::Result<FeedbackRecord> {
        Ok(FeedbackRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            task_id: row.get(2)?,
            rating: row.get(3)?,
            comment: row.get(4)?,
            feedback_type: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn map_settings(row: &Row<'_>) -> rusqlite::Result<UserSettingsRecord> {
        Ok(UserSettingsRecord {
            user_id: row.get(0)?,
            llm_provider: row.get(1)?,
            llm_model: row.get(2)?,
            llm_api_key: row.get(3)?,
            llm_api_base: row.get(4)?,
            theme: row.get(5)?,
            language: row.get(6)?,
            timezone: row.get(7)?,
            email_notifications: row.get::<_, i64>(8)? != 0,
            task_completion_notifications: row.get::<_, i64>(9)? != 0,
            project_updates_notifications: row.get::<_, i64>(10)? != 0,
            auto_save_interval: row.get(11)?,
            max_concurrent_tasks: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn get_user_where(&self, column: &str, value: &str) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let cleaned = value.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ? COLLATE NOCASE"),
                params![cleaned],
                Self::map_user,
            )
            .optional()?;
        Ok(row)
    }

    fn result_to_text(value: &Option<serde_json::Value>) -> Option<String> {
        value.as_ref().map(json_to_string)
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL UNIQUE,
              email TEXT NOT NULL UNIQUE,
              full_name TEXT,
              password_hash TEXT NOT NULL,
              role TEXT NOT NULL DEFAULT 'user',
              subscription_tier TEXT NOT NULL DEFAULT 'free',
              subscription_status TEXT NOT NULL DEFAULT 'active',
              is_active INTEGER NOT NULL DEFAULT 1,
              is_verified INTEGER NOT NULL DEFAULT 0,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              last_login_at REAL
            );
            CREATE TABLE IF NOT EXISTS projects (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              owner_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              description TEXT,
              status TEXT NOT NULL DEFAULT 'active',
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects (owner_id, created_at);
            CREATE TABLE IF NOT EXISTS tasks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              project_id INTEGER,
              title TEXT NOT NULL,
              description TEXT,
              query TEXT,
              task_type TEXT,
              agent_name TEXT,
              status TEXT NOT NULL DEFAULT 'pending',
              priority TEXT NOT NULL DEFAULT 'medium',
              job_id TEXT,
              queued_at REAL,
              started_at REAL,
              completed_at REAL,
              execution_time REAL,
              result TEXT,
              output_files TEXT,
              error TEXT,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks (project_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, completed_at);
            CREATE TABLE IF NOT EXISTS task_executions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              task_id INTEGER NOT NULL,
              queued_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_executions_user ON task_executions (user_id, queued_at);
            CREATE TABLE IF NOT EXISTS subtasks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id INTEGER NOT NULL,
              agent_name TEXT NOT NULL,
              description TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              result TEXT,
              execution_order INTEGER NOT NULL DEFAULT 0,
              created_at REAL NOT NULL,
              completed_at REAL
            );
            CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks (task_id, execution_order);
            CREATE TABLE IF NOT EXISTS integrations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              integration_type TEXT NOT NULL,
              api_key TEXT,
              config TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              UNIQUE (user_id, integration_type)
            );
            CREATE TABLE IF NOT EXISTS agent_memory (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              agent_name TEXT NOT NULL,
              memory_type TEXT NOT NULL,
              content TEXT NOT NULL,
              context_tags TEXT,
              relevance_score REAL NOT NULL DEFAULT 1.0,
              access_count INTEGER NOT NULL DEFAULT 0,
              created_at REAL NOT NULL,
              accessed_at REAL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_memory_agent
              ON agent_memory (agent_name, memory_type, relevance_score);
            CREATE TABLE IF NOT EXISTS feedback (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              task_id INTEGER NOT NULL,
              rating INTEGER NOT NULL,
              comment TEXT,
              feedback_type TEXT NOT NULL DEFAULT 'general',
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_task ON feedback (task_id);
            CREATE INDEX IF NOT EXISTS idx_feedback_user ON feedback (user_id, created_at);
            CREATE TABLE IF NOT EXISTS user_settings (
              user_id INTEGER PRIMARY KEY,
              llm_provider TEXT NOT NULL,
              llm_model TEXT NOT NULL,
              llm_api_key TEXT,
              llm_api_base TEXT,
              theme TEXT NOT NULL,
              language TEXT NOT NULL,
              timezone TEXT NOT NULL,
              email_notifications INTEGER NOT NULL,
              task_completion_notifications INTEGER NOT NULL,
              project_updates_notifications INTEGER NOT NULL,
              auto_save_interval INTEGER NOT NULL,
              max_concurrent_tasks INTEGER NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn insert_user(&self, record: &UserRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO users (username, email, full_name, password_hash, role, subscription_tier, subscription_status, \
             is_active, is_verified, created_at, updated_at, last_login_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.username,
                record.email,
                record.full_name,
                record.password_hash,
                record.role,
                record.subscription_tier,
                record.subscription_status,
                record.is_active as i64,
                record.is_verified as i64,
                record.created_at,
                record.updated_at,
                record.last_login_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_user(&self, record: &UserRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE users SET username = ?, email = ?, full_name = ?, password_hash = ?, role = ?, subscription_tier = ?, \
             subscription_status = ?, is_active = ?, is_verified = ?, updated_at = ?, last_login_at = ? WHERE id = ?",
            params![
                record.username,
                record.email,
                record.full_name,
                record.password_hash,
                record.role,
                record.subscription_tier,
                record.subscription_status,
                record.is_active as i64,
                record.is_verified as i64,
                record.updated_at,
                record.last_login_at,
                record.id
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
                params![id],
                Self::map_user,
            )
            .optional()?;
        Ok(row)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        self.get_user_where("username", username)
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        self.get_user_where("email", email)
    }

    fn list_users(&self, offset: i64, limit: i64) -> Result<(Vec<UserRecord>, i64)> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id ASC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt
            .query_map(params![limit.max(1), offset.max(0)], Self::map_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
    }

    fn insert_project(&self, record: &ProjectRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO projects (owner_id, name, description, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.owner_id,
                record.name,
                record.description,
                record.status,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_project(&self, record: &ProjectRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE projects SET name = ?, description = ?, status = ?, updated_at = ? WHERE id = ? AND owner_id = ?",
            params![
                record.name,
                record.description,
                record.status,
                record.updated_at,
                record.id,
                record.owner_id
            ],
        )?;
        Ok(())
    }

    fn get_project(&self, owner_id: i64, id: i64) -> Result<Option<ProjectRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = ? AND p.owner_id = ?"),
                params![id, owner_id],
                Self::map_project,
            )
            .optional()?;
        Ok(row)
    }

    fn list_projects(&self, owner_id: i64, offset: i64, limit: i64) -> Result<Vec<ProjectRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.owner_id = ? \
             ORDER BY p.created_at DESC, p.id DESC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt
            .query_map(
                params![owner_id, limit.max(1), offset.max(0)],
                Self::map_project,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn delete_project(&self, owner_id: i64, id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "DELETE FROM projects WHERE id = ? AND owner_id = ?",
            params![id, owner_id],
        )?;
        if affected > 0 {
            tx.execute(
                "UPDATE tasks SET project_id = NULL, updated_at = ? WHERE project_id = ? AND user_id = ?",
                params![Self::now_ts(), id, owner_id],
            )?;
        }
        tx.commit()?;
        Ok(affected as i64)
    }

    fn count_projects(&self, owner_id: Option<i64>) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let total: i64 = match owner_id {
            Some(owner_id) => conn.query_row(
                "SELECT COUNT(*) FROM projects WHERE owner_id = ?",
                params![owner_id],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?,
        };
        Ok(total)
    }

    fn insert_task(&self, record: &TaskRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tasks (user_id, project_id, title, description, query, task_type, agent_name, status, priority, \
             job_id, queued_at, started_at, completed_at, execution_time, result, output_files, error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.user_id,
                record.project_id,
                record.title,
                record.description,
                record.query,
                record.task_type,
                record.agent_name,
                record.status,
                record.priority,
                record.job_id,
                record.queued_at,
                record.started_at,
                record.completed_at,
                record.execution_time,
                Self::result_to_text(&record.result),
                string_list_to_json(&record.output_files),
                record.error,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_task(&self, record: &TaskRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE tasks SET project_id = ?, title = ?, description = ?, query = ?, task_type = ?, agent_name = ?, \
             status = ?, priority = ?, job_id = ?, queued_at = ?, started_at = ?, completed_at = ?, execution_time = ?, \
             result = ?, output_files = ?, error = ?, updated_at = ? WHERE id = ?",
            params![
                record.project_id,
                record.title,
                record.description,
                record.query,
                record.task_type,
                record.agent_name,
                record.status,
                record.priority,
                record.job_id,
                record.queued_at,
                record.started_at,
                record.completed_at,
                record.execution_time,
                Self::result_to_text(&record.result),
                string_list_to_json(&record.output_files),
                record.error,
                record.updated_at,
                record.id
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
                params![id],
                Self::map_task,
            )
            .optional()?;
        Ok(row)
    }

    fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        self.ensure_initialized()?;
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?");
        let mut params_list: Vec<SqlValue> = vec![SqlValue::Integer(query.user_id)];
        if let Some(status) = query.status.as_deref().filter(|value| !value.is_empty()) {
            sql.push_str(" AND status = ?");
            params_list.push(SqlValue::Text(status.to_string()));
        }
        if let Some(project_id) = query.project_id {
            sql.push_str(" AND project_id = ?");
            params_list.push(SqlValue::Integer(project_id));
        }
        if let Some(agent) = query.agent_name.as_deref().filter(|value| !value.is_empty()) {
            sql.push_str(" AND agent_name = ?");
            params_list.push(SqlValue::Text(agent.to_string()));
        }
        if let Some(search) = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            sql.push_str(
                " AND (title LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\' OR query LIKE ? ESCAPE '\\')",
            );
            let pattern = escape_like(search);
            for _ in 0..3 {
                params_list.push(SqlValue::Text(pattern.clone()));
            }
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        params_list.push(SqlValue::Integer(query.limit.max(1)));
        params_list.push(SqlValue::Integer(query.offset.max(0)));
        let conn = self.open()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), Self::map_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn delete_task(&self, user_id: i64, id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "DELETE FROM tasks WHERE id = ? AND user_id = ?",
            params![id, user_id],
        )?;
        if affected > 0 {
            tx.execute("DELETE FROM subtasks WHERE task_id = ?", params![id])?;
            tx.execute("DELETE FROM feedback WHERE task_id = ?", params![id])?;
        }
        tx.commit()?;
        Ok(affected as i64)
    }

    fn task_stats(&self, user_id: Option<i64>) -> Result<TaskStats> {
        self.ensure_initialized()?;
        let mut sql = String::from(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0), \
             AVG(CASE WHEN status = 'completed' THEN execution_time END) FROM tasks",
        );
        let mut params_list: Vec<SqlValue> = Vec::new();
        if let Some(user_id) = user_id {
            sql.push_str(" WHERE user_id = ?");
            params_list.push(SqlValue::Integer(user_id));
        }
        let conn = self.open()?;
        let stats = conn.query_row(&sql, params_from_iter(params_list.iter()), |row| {
            Ok(TaskStats {
                total: row.get(0)?,
                pending: row.get(1)?,
                in_progress: row.get(2)?,
                completed: row.get(3)?,
                failed: row.get(4)?,
                avg_execution_time: row.get(5)?,
            })
        })?;
        Ok(stats)
    }

    fn agent_task_stats(&self, user_id: Option<i64>) -> Result<Vec<AgentTaskStats>> {
        self.ensure_initialized()?;
        let mut sql = String::from(
            "SELECT COALESCE(agent_name, task_type, 'unassigned') AS agent, COUNT(*), \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0), \
             AVG(CASE WHEN status = 'completed' THEN execution_time END) FROM tasks",
        );
        let mut params_list: Vec<SqlValue> = Vec::new();
        if let Some(user_id) = user_id {
            sql.push_str(" WHERE user_id = ?");
            params_list.push(SqlValue::Integer(user_id));
        }
        sql.push_str(" GROUP BY agent ORDER BY agent");
        let conn = self.open()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params_list.iter()), |row| {
                Ok(AgentTaskStats {
                    agent_name: row.get(0)?,
                    total: row.get(1)?,
                    completed: row.get(2)?,
                    failed: row.get(3)?,
                    avg_execution_time: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn count_tasks_created_since(&self, user_id: i64, since: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE user_id = ? AND created_at >= ?",
            params![user_id, since],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn record_task_execution(&self, user_id: i64, task_id: i64, queued_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO task_executions (user_id, task_id, queued_at) VALUES (?, ?, ?)",
            params![user_id, task_id, queued_at],
        )?;
        Ok(())
    }

    fn count_executions_since(&self, user_id: i64, since: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM task_executions WHERE user_id = ? AND queued_at >= ?",
            params![user_id, since],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn mark_task_started(
        &self,
        id: i64,
        job_id: &str,
        started_at: f64,
        agent_name: &str,
    ) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at = ?, agent_name = COALESCE(agent_name, ?), \
             updated_at = ? WHERE id = ? AND job_id = ?",
            params![started_at, agent_name, started_at, id, job_id],
        )?;
        Ok(affected > 0)
    }

    fn finish_task(&self, outcome: &TaskOutcome) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE tasks SET status = ?, result = ?, error = ?, execution_time = ?, completed_at = ?, \
             updated_at = ? WHERE id = ? AND job_id = ?",
            params![
                outcome.status,
                Self::result_to_text(&outcome.result),
                outcome.error,
                outcome.execution_time,
                outcome.completed_at,
                outcome.completed_at,
                outcome.task_id,
                outcome.job_id
            ],
        )?;
        Ok(affected > 0)
    }

    fn fail_interrupted_tasks(&self, message: &str, now: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let selector = "SELECT id FROM tasks WHERE status = 'in_progress' \
                        OR (status = 'pending' AND job_id IS NOT NULL)";
        tx.execute(
            &format!(
                "UPDATE subtasks SET status = 'failed', result = ?, completed_at = ? \
                 WHERE status IN ('pending', 'in_progress') AND task_id IN ({selector})"
            ),
            params![json_to_string(&serde_json::json!({ "error": message })), now],
        )?;
        let affected = tx.execute(
            "UPDATE tasks SET status = 'failed', error = ?, completed_at = ?, updated_at = ? \
             WHERE status = 'in_progress' OR (status = 'pending' AND job_id IS NOT NULL)",
            params![message, now, now],
        )?;
        tx.commit()?;
        Ok(affected as i64)
    }

    fn delete_finished_tasks_before(&self, cutoff: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let selector = "SELECT id FROM tasks WHERE status IN ('completed', 'failed') \
                        AND completed_at IS NOT NULL AND completed_at < ?";
        tx.execute(
            &format!("DELETE FROM subtasks WHERE task_id IN ({selector})"),
            params![cutoff],
        )?;
        tx.execute(
            &format!("DELETE FROM feedback WHERE task_id IN ({selector})"),
            params![cutoff],
        )?;
        let affected = tx.execute(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed') \
             AND completed_at IS NOT NULL AND completed_at < ?",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(affected as i64)
    }

    fn insert_subtask(&self, record: &SubTaskRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO subtasks (task_id, agent_name, description, status, result, execution_order, created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.task_id,
                record.agent_name,
                record.description,
                record.status,
                Self::result_to_text(&record.result),
                record.execution_order,
                record.created_at,
                record.completed_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_subtask(&self, record: &SubTaskRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE subtasks SET status = ?, result = ?, completed_at = ? WHERE id = ?",
            params![
                record.status,
                Self::result_to_text(&record.result),
                record.completed_at,
                record.id
            ],
        )?;
        Ok(())
    }

    fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubTaskRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ? ORDER BY execution_order ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![task_id], Self::map_subtask)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn fail_open_subtasks(&self, task_id: i64, message: &str, now: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE subtasks SET status = 'failed', result = ?, completed_at = ? \
             WHERE task_id = ? AND status IN ('pending', 'in_progress')",
            params![
                json_to_string(&serde_json::json!({ "error": message })),
                now,
                task_id
            ],
        )?;
        Ok(affected as i64)
    }

    fn insert_integration(&self, record: &IntegrationRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO integrations (user_id, integration_type, api_key, config, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                record.user_id,
                record.integration_type,
                record.api_key,
                json_to_string(&record.config),
                record.is_active as i64,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_integration(&self, record: &IntegrationRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE integrations SET api_key = ?, config = ?, is_active = ?, updated_at = ? WHERE id = ? AND user_id = ?",
            params![
                record.api_key,
                json_to_string(&record.config),
                record.is_active as i64,
                record.updated_at,
                record.id,
                record.user_id
            ],
        )?;
        Ok(())
    }

    fn get_integration(&self, user_id: i64, id: i64) -> Result<Option<IntegrationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = ? AND user_id = ?"),
                params![id, user_id],
                Self::map_integration,
            )
            .optional()?;
        Ok(row)
    }

    fn get_integration_by_type(
        &self,
        user_id: i64,
        integration_type: &str,
    ) -> Result<Option<IntegrationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE user_id = ? AND integration_type = ?"
                ),
                params![user_id, integration_type.trim()],
                Self::map_integration,
            )
            .optional()?;
        Ok(row)
    }

    fn list_integrations(&self, user_id: i64) -> Result<Vec<IntegrationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE user_id = ? ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], Self::map_integration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn delete_integration(&self, user_id: i64, id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM integrations WHERE id = ? AND user_id = ?",
            params![id, user_id],
        )?;
        Ok(affected as i64)
    }

    fn insert_agent_memory(&self, record: &AgentMemoryRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO agent_memory (agent_name, memory_type, content, context_tags, relevance_score, access_count, \
             created_at, accessed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.agent_name,
                record.memory_type,
                json_to_string(&record.content),
                string_list_to_json(&record.context_tags),
                record.relevance_score,
                record.access_count,
                record.created_at,
                record.accessed_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_agent_memory(
        &self,
        agent_name: &str,
        memory_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AgentMemoryRecord>> {
        self.ensure_initialized()?;
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM agent_memory WHERE agent_name = ?");
        let mut params_list: Vec<SqlValue> = vec![SqlValue::Text(agent_name.trim().to_string())];
        if let Some(memory_type) = memory_type.map(str::trim).filter(|value| !value.is_empty()) {
            sql.push_str(" AND memory_type = ?");
            params_list.push(SqlValue::Text(memory_type.to_string()));
        }
        sql.push_str(" ORDER BY relevance_score DESC, created_at DESC LIMIT ?");
        params_list.push(SqlValue::Integer(limit.max(1)));
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut rows = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params_list.iter()), Self::map_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let now = Self::now_ts();
        for row in rows.iter_mut() {
            tx.execute(
                "UPDATE agent_memory SET access_count = access_count + 1, accessed_at = ? WHERE id = ?",
                params![now, row.id],
            )?;
            row.access_count += 1;
            row.accessed_at = Some(now);
        }
        tx.commit()?;
        Ok(rows)
    }

    fn list_agent_memory_since(&self, since: f64) -> Result<Vec<AgentMemoryRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM agent_memory WHERE created_at >= ? ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![since], Self::map_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn update_memory_relevance(&self, id: i64, relevance_score: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE agent_memory SET relevance_score = ? WHERE id = ?",
            params![relevance_score, id],
        )?;
        Ok(())
    }

    fn delete_stale_agent_memory(&self, cutoff: f64, min_relevance: f64) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM agent_memory WHERE created_at < ? AND relevance_score < ?",
            params![cutoff, min_relevance],
        )?;
        Ok(affected as i64)
    }

    fn insert_feedback(&self, record: &FeedbackRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO feedback (user_id, task_id, rating, comment, feedback_type, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.user_id,
                record.task_id,
                record.rating,
                record.comment,
                record.feedback_type,
                record.created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_feedback_by_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<FeedbackRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, limit.max(1), offset.max(0)],
                Self::map_feedback,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_feedback_by_task(&self, task_id: i64) -> Result<Vec<FeedbackRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE task_id = ? ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(params![task_id], Self::map_feedback)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettingsRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {SETTINGS_COLUMNS} FROM user_settings WHERE user_id = ?"),
                params![user_id],
                Self::map_settings,
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_user_settings(&self, record: &UserSettingsRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            &format!(
                "INSERT INTO user_settings ({SETTINGS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(user_id) DO UPDATE SET llm_provider = excluded.llm_provider, llm_model = excluded.llm_model, \
                 llm_api_key = excluded.llm_api_key, llm_api_base = excluded.llm_api_base, theme = excluded.theme, \
                 language = excluded.language, timezone = excluded.timezone, \
                 email_notifications = excluded.email_notifications, \
                 task_completion_notifications = excluded.task_completion_notifications, \
                 project_updates_notifications = excluded.project_updates_notifications, \
                 auto_save_interval = excluded.auto_save_interval, max_concurrent_tasks = excluded.max_concurrent_tasks, \
                 updated_at = excluded.updated_at"
            ),
            params![
                record.user_id,
                record.llm_provider,
                record.llm_model,
                record.llm_api_key,
                record.llm_api_base,
                record.theme,
                record.language,
                record.timezone,
                record.email_notifications as i64,
                record.task_completion_notifications as i64,
                record.project_updates_notifications as i64,
                record.auto_save_interval,
                record.max_concurrent_tasks,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn delete_user_settings(&self, user_id: i64) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM user_settings WHERE user_id = ?",
            params![user_id],
        )?;
        Ok(affected as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{TASK_STATUS_COMPLETED, TASK_STATUS_IN_PROGRESS, TASK_STATUS_PENDING};
    use serde_json::json;

    fn temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aigentic.db");
        let storage = SqliteStorage::new(path.to_string_lossy().to_string());
        storage.ensure_initialized().unwrap();
        (dir, storage)
    }

    fn task(user_id: i64, title: &str, now: f64) -> TaskRecord {
        TaskRecord {
            id: 0,
            user_id,
            project_id: None,
            title: title.to_string(),
            description: None,
            query: None,
            task_type: None,
            agent_name: Some("research".to_string()),
            status: TASK_STATUS_PENDING.to_string(),
            priority: "medium".to_string(),
            job_id: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
            execution_time: None,
            result: None,
            output_files: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn deleting_project_detaches_tasks() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        let project_id = storage
            .insert_project(&ProjectRecord {
                id: 0,
                owner_id: 1,
                name: "Launch".to_string(),
                description: None,
                status: "active".to_string(),
                task_count: 0,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        let mut record = task(1, "write copy", now);
        record.project_id = Some(project_id);
        let task_id = storage.insert_task(&record).unwrap();

        let project = storage.get_project(1, project_id).unwrap().unwrap();
        assert_eq!(project.task_count, 1);
        assert!(storage.get_project(2, project_id).unwrap().is_none());

        assert_eq!(storage.delete_project(1, project_id).unwrap(), 1);
        assert!(storage.get_project(1, project_id).unwrap().is_none());
        let task = storage.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.project_id, None);
    }

    #[test]
    fn cleanup_only_removes_old_finished_tasks() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        let mut old = task(1, "old", now - 100.0);
        old.status = TASK_STATUS_COMPLETED.to_string();
        old.completed_at = Some(now - 90.0);
        old.result = Some(json!({ "content": "done" }));
        let old_id = storage.insert_task(&old).unwrap();
        let fresh_id = storage.insert_task(&task(1, "fresh", now)).unwrap();

        assert_eq!(storage.delete_finished_tasks_before(now - 10.0).unwrap(), 1);
        assert!(storage.get_task(old_id).unwrap().is_none());
        assert!(storage.get_task(fresh_id).unwrap().is_some());
    }

    #[test]
    fn memory_listing_orders_by_relevance_and_counts_access() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        for (score, kind) in [(0.2, "learning"), (0.9, "feedback"), (0.5, "learning")] {
            storage
                .insert_agent_memory(&AgentMemoryRecord {
                    id: 0,
                    agent_name: "content".to_string(),
                    memory_type: kind.to_string(),
                    content: json!({ "note": kind }),
                    context_tags: vec!["blog".to_string()],
                    relevance_score: score,
                    access_count: 0,
                    created_at: now,
                    accessed_at: None,
                })
                .unwrap();
        }
        let all = storage.list_agent_memory("content", None, 50).unwrap();
        let scores: Vec<f64> = all.iter().map(|item| item.relevance_score).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.2]);
        assert!(all.iter().all(|item| item.access_count == 1));

        let learning = storage
            .list_agent_memory("content", Some("learning"), 50)
            .unwrap();
        assert_eq!(learning.len(), 2);
        assert!(learning.iter().all(|item| item.access_count == 2));
    }

    #[test]
    fn task_search_matches_title_and_query() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        let mut a = task(1, "Market scan", now);
        a.query = Some("competitor pricing".to_string());
        storage.insert_task(&a).unwrap();
        storage.insert_task(&task(1, "Blog draft", now)).unwrap();
        storage.insert_task(&task(2, "Market scan", now)).unwrap();

        let query = TaskQuery {
            user_id: 1,
            search: Some("pricing".to_string()),
            limit: 100,
            ..TaskQuery::default()
        };
        let found = storage.list_tasks(&query).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Market scan");
    }

    #[test]
    fn execution_log_outlives_deleted_tasks() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        let task_id = storage.insert_task(&task(1, "digest", now)).unwrap();
        storage.record_task_execution(1, task_id, now - 7200.0).unwrap();
        storage.record_task_execution(1, task_id, now).unwrap();
        storage.record_task_execution(2, 99, now).unwrap();

        assert_eq!(storage.delete_task(1, task_id).unwrap(), 1);
        assert_eq!(storage.count_executions_since(1, now - 3600.0).unwrap(), 1);
        assert_eq!(storage.count_executions_since(1, 0.0).unwrap(), 2);
        assert_eq!(storage.delete_finished_tasks_before(now + 1.0).unwrap(), 0);
        assert_eq!(storage.count_executions_since(1, 0.0).unwrap(), 2);
    }

    #[test]
    fn run_writes_leave_user_columns_alone() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        let mut record = task(1, "draft", now);
        record.agent_name = None;
        record.job_id = Some("job-a".to_string());
        let task_id = storage.insert_task(&record).unwrap();

        assert!(!storage.mark_task_started(task_id, "job-b", now, "content").unwrap());
        assert!(storage.mark_task_started(task_id, "job-a", now, "content").unwrap());
        let mut edited = storage.get_task(task_id).unwrap().unwrap();
        assert_eq!(edited.status, TASK_STATUS_IN_PROGRESS);
        assert_eq!(edited.agent_name.as_deref(), Some("content"));
        edited.title = "final draft".to_string();
        edited.priority = "high".to_string();
        storage.update_task(&edited).unwrap();

        let outcome = TaskOutcome {
            task_id,
            job_id: "job-a".to_string(),
            status: TASK_STATUS_COMPLETED.to_string(),
            result: Some(json!({ "content": "done" })),
            error: None,
            execution_time: 1.5,
            completed_at: now + 2.0,
        };
        assert!(storage.finish_task(&outcome).unwrap());
        let finished = storage.get_task(task_id).unwrap().unwrap();
        assert_eq!(finished.status, TASK_STATUS_COMPLETED);
        assert_eq!(finished.title, "final draft");
        assert_eq!(finished.priority, "high");
        assert_eq!(finished.execution_time, Some(1.5));
        assert_eq!(finished.result, Some(json!({ "content": "done" })));

        let stale = TaskOutcome {
            job_id: "job-b".to_string(),
            status: "failed".to_string(),
            ..outcome
        };
        assert!(!storage.finish_task(&stale).unwrap());
        assert_eq!(
            storage.get_task(task_id).unwrap().unwrap().status,
            TASK_STATUS_COMPLETED
        );
    }

    #[test]
    fn interrupted_tasks_and_their_open_subtasks_fail() {
        let (_dir, storage) = temp_storage();
        let now = SqliteStorage::now_ts();
        let mut running = task(1, "running", now);
        running.status = TASK_STATUS_IN_PROGRESS.to_string();
        let running_id = storage.insert_task(&running).unwrap();
        let mut queued = task(1, "queued", now);
        queued.job_id = Some("job-q".to_string());
        let queued_id = storage.insert_task(&queued).unwrap();
        let idle_id = storage.insert_task(&task(1, "idle", now)).unwrap();
        for (order, status) in [(0, TASK_STATUS_COMPLETED), (1, TASK_STATUS_IN_PROGRESS)] {
            storage
                .insert_subtask(&SubTaskRecord {
                    id: 0,
                    task_id: running_id,
                    agent_name: "research".to_string(),
                    description: format!("step {order}"),
                    status: status.to_string(),
                    result: None,
                    execution_order: order,
                    created_at: now,
                    completed_at: None,
                })
                .unwrap();
        }

        assert_eq!(storage.fail_interrupted_tasks("restarted", now).unwrap(), 2);
        for id in [running_id, queued_id] {
            let task = storage.get_task(id).unwrap().unwrap();
            assert_eq!(task.status, "failed");
            assert_eq!(task.error.as_deref(), Some("restarted"));
            assert_eq!(task.completed_at, Some(now));
        }
        assert_eq!(
            storage.get_task(idle_id).unwrap().unwrap().status,
            TASK_STATUS_PENDING
        );
        let statuses: Vec<String> = storage
            .list_subtasks(running_id)
            .unwrap()
            .into_iter()
            .map(|item| item.status)
            .collect();
        assert_eq!(statuses, vec!["completed", "failed"]);
        assert_eq!(storage.fail_open_subtasks(running_id, "again", now).unwrap(), 0);
    }
}
