// Periodic jobs: finished-task cleanup, agent-memory aging and usage analytics snapshots.
use crate::core::config::WorkerConfig;
use crate::core::time_utils::{format_ts, now_ts};
use crate::services::executor::run_storage;
use crate::storage::StorageBackend;
use anyhow::Result;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub type AnalyticsCache = Arc<RwLock<Option<Value>>>;

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;
const DECAY_FLOOR: f64 = 0.1;
const DECAY_MIN_CHANGE: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCleanup {
    pub deleted: i64,
    pub decayed: i64,
}

/// Deletes completed and failed tasks that finished before the retention window.
pub fn cleanup_old_tasks(storage: &dyn StorageBackend, retention_days: i64, now: f64) -> Result<i64> {
    let cutoff = now - retention_days.max(0) as f64 * SECONDS_PER_DAY;
    storage.delete_finished_tasks_before(cutoff)
}

/// Deletes old low-relevance memories, then decays the scores of memories inside the decay
/// window. Scores that would move by less than 0.05 are left as they are.
pub fn cleanup_agent_memory(
    storage: &dyn StorageBackend,
    config: &WorkerConfig,
    now: f64,
) -> Result<MemoryCleanup> {
    let cutoff = now - config.memory_retention_days.max(0) as f64 * SECONDS_PER_DAY;
    let deleted = storage.delete_stale_agent_memory(cutoff, config.memory_min_relevance)?;
    let since = now - config.memory_decay_window_days.max(0) as f64 * SECONDS_PER_DAY;
    let mut decayed = 0;
    for memory in storage.list_agent_memory_since(since)? {
        let score = decayed_relevance(
            memory.relevance_score,
            memory.created_at,
            now,
            config.memory_decay_per_day,
        );
        if (score - memory.relevance_score).abs() > DECAY_MIN_CHANGE {
            storage.update_memory_relevance(memory.id, score)?;
            decayed += 1;
        }
    }
    Ok(MemoryCleanup { deleted, decayed })
}

/// Linear decay per whole day of age, never below a tenth of the score.
pub fn decayed_relevance(score: f64, created_at: f64, now: f64, per_day: f64) -> f64 {
    let days_old = ((now - created_at) / SECONDS_PER_DAY).floor().max(0.0);
    score * (1.0 - days_old * per_day).max(DECAY_FLOOR)
}

pub fn generate_usage_analytics(storage: &dyn StorageBackend, now: f64) -> Result<Value> {
    let (_, total_users) = storage.list_users(0, 1)?;
    let total_projects = storage.count_projects(None)?;
    let tasks = storage.task_stats(None)?;
    let agents: Vec<Value> = storage
        .agent_task_stats(None)?
        .into_iter()
        .map(|stats| {
            let success_rate = if stats.total > 0 {
                stats.completed as f64 / stats.total as f64
            } else {
                0.0
            };
            json!({
                "agent_name": stats.agent_name,
                "total_tasks": stats.total,
                "completed_tasks": stats.completed,
                "failed_tasks": stats.failed,
                "success_rate": success_rate,
                "avg_execution_time": stats.avg_execution_time,
            })
        })
        .collect();
    Ok(json!({
        "generated_at": format_ts(now),
        "total_users": total_users,
        "total_projects": total_projects,
        "tasks": {
            "total": tasks.total,
            "pending": tasks.pending,
            "in_progress": tasks.in_progress,
            "completed": tasks.completed,
            "failed": tasks.failed,
            "avg_execution_time": tasks.avg_execution_time,
        },
        "agents": agents,
    }))
}

pub fn spawn_maintenance(
    storage: Arc<dyn StorageBackend>,
    cache: AnalyticsCache,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut cleanup = tokio::time::interval(Duration::from_secs(config.cleanup_interval_s.max(60)));
        let mut analytics =
            tokio::time::interval(Duration::from_secs(config.analytics_interval_s.max(60)));
        let retention_days = config.task_retention_days;
        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    match run_storage(&storage, move |storage| {
                        cleanup_old_tasks(storage, retention_days, now_ts())
                    })
                    .await
                    {
                        Ok(removed) => info!("cleanup removed {removed} finished task(s)"),
                        Err(err) => warn!("cleanup of old tasks failed: {err}"),
                    }
                    let memory_config = config.clone();
                    match run_storage(&storage, move |storage| {
                        cleanup_agent_memory(storage, &memory_config, now_ts())
                    })
                    .await
                    {
                        Ok(outcome) => info!(
                            "memory cleanup deleted {} and decayed {} memories",
                            outcome.deleted, outcome.decayed
                        ),
                        Err(err) => warn!("agent memory cleanup failed: {err}"),
                    }
                }
                _ = analytics.tick() => {
                    match run_storage(&storage, |storage| generate_usage_analytics(storage, now_ts())).await {
                        Ok(snapshot) => {
                            info!(
                                "usage analytics: users={} tasks={}",
                                snapshot["total_users"], snapshot["tasks"]["total"]
                            );
                            *cache.write() = Some(snapshot);
                        }
                        Err(err) => warn!("usage analytics failed: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("maintenance loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AgentMemoryRecord, ProjectRecord, SqliteStorage};
    use tempfile::tempdir;

    fn memory(created_at: f64, relevance_score: f64) -> AgentMemoryRecord {
        AgentMemoryRecord {
            id: 0,
            agent_name: "research".to_string(),
            memory_type: "feedback".to_string(),
            content: json!({}),
            context_tags: Vec::new(),
            relevance_score,
            access_count: 0,
            created_at,
            accessed_at: None,
        }
    }

    #[test]
    fn analytics_snapshot_counts_platform_totals() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("stats.db").to_string_lossy().to_string());
        storage
            .insert_project(&ProjectRecord {
                id: 0,
                owner_id: 1,
                name: "launch".to_string(),
                description: None,
                status: "active".to_string(),
                task_count: 0,
                created_at: 0.0,
                updated_at: 0.0,
            })
            .unwrap();
        let snapshot = generate_usage_analytics(&storage, 1_709_251_200.0).unwrap();
        assert_eq!(snapshot["generated_at"], "2024-03-01T00:00:00.000Z");
        assert_eq!(snapshot["total_users"], 0);
        assert_eq!(snapshot["total_projects"], 1);
        assert_eq!(snapshot["tasks"]["total"], 0);
        assert!(snapshot["agents"].as_array().unwrap().is_empty());
    }

    #[test]
    fn cleanup_with_empty_store_removes_nothing() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("clean.db").to_string_lossy().to_string());
        assert_eq!(cleanup_old_tasks(&storage, 30, now_ts()).unwrap(), 0);
    }

    #[test]
    fn memory_cleanup_drops_stale_rows_and_decays_recent_ones() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("memory.db").to_string_lossy().to_string());
        let now = 1_709_251_200.0;
        let day = SECONDS_PER_DAY;
        let stale = storage.insert_agent_memory(&memory(now - 120.0 * day, 0.2)).unwrap();
        let kept_old = storage.insert_agent_memory(&memory(now - 120.0 * day, 0.8)).unwrap();
        let aging = storage.insert_agent_memory(&memory(now - 10.0 * day, 1.0)).unwrap();
        let fresh = storage.insert_agent_memory(&memory(now - 3600.0, 1.0)).unwrap();

        let outcome = cleanup_agent_memory(&storage, &WorkerConfig::default(), now).unwrap();
        assert_eq!(outcome, MemoryCleanup { deleted: 1, decayed: 1 });

        let remaining = storage.list_agent_memory("research", None, 50).unwrap();
        let score = |id: i64| {
            remaining
                .iter()
                .find(|item| item.id == id)
                .map(|item| item.relevance_score)
        };
        assert_eq!(score(stale), None);
        assert_eq!(score(kept_old), Some(0.8));
        assert!((score(aging).unwrap() - 0.9).abs() < 1e-9);
        assert_eq!(score(fresh), Some(1.0));
    }

    #[test]
    fn decay_is_floored() {
        assert!((decayed_relevance(1.0, 0.0, 200.0 * SECONDS_PER_DAY, 0.01) - 0.1).abs() < 1e-9);
        assert_eq!(decayed_relevance(0.5, 100.0, 50.0, 0.01), 0.5);
    }
}
