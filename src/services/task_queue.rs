// Background execution: a bounded job channel drained by a fixed pool of workers.
use crate::core::time_utils::now_ts;
use crate::services::executor::{run_storage, TaskExecutor};
use crate::storage::{
    AgentMemoryRecord, StorageBackend, TaskOutcome, TaskRecord, TASK_STATUS_COMPLETED,
    TASK_STATUS_FAILED, TASK_STATUS_IN_PROGRESS, TASK_STATUS_PENDING,
};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const MEMORY_SUMMARY_CHARS: usize = 500;
pub const INTERRUPTED_TASK_ERROR: &str = "Interrupted by server restart";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskJob {
    pub task_id: i64,
    pub job_id: String,
}

#[derive(Debug)]
pub enum EnqueueError {
    QueueFull,
    Closed,
    Internal(anyhow::Error),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::QueueFull => write!(f, "Task queue is full, try again later"),
            EnqueueError::Closed => write!(f, "Task queue is shut down"),
            EnqueueError::Internal(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    storage: Arc<dyn StorageBackend>,
    sender: mpsc::Sender<TaskJob>,
    receiver: Arc<Mutex<mpsc::Receiver<TaskJob>>>,
}

impl TaskQueue {
    pub fn new(storage: Arc<dyn StorageBackend>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            storage,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Marks the task queued, logs the execution against the owner's quota and hands the job
    /// to the workers.
    pub async fn enqueue(&self, mut task: TaskRecord) -> Result<TaskRecord, EnqueueError> {
        let permit = self.sender.try_reserve().map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })?;
        let now = now_ts();
        let job_id = Uuid::new_v4().simple().to_string();
        task.job_id = Some(job_id.clone());
        task.queued_at = Some(now);
        task.status = TASK_STATUS_PENDING.to_string();
        task.started_at = None;
        task.completed_at = None;
        task.error = None;
        task.updated_at = now;
        let record = task.clone();
        run_storage(&self.storage, move |storage| {
            storage.update_task(&record)?;
            storage.record_task_execution(record.user_id, record.id, now)
        })
        .await
        .map_err(EnqueueError::Internal)?;
        permit.send(TaskJob {
            task_id: task.id,
            job_id,
        });
        info!("task {} queued as job {:?}", task.id, task.job_id);
        Ok(task)
    }

    pub fn spawn_workers(
        &self,
        worker: Arc<TaskWorker>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|index| {
                let receiver = self.receiver.clone();
                let worker = worker.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(index, receiver, worker, shutdown).await;
                })
            })
            .collect()
    }
}

/// Fails tasks a previous process queued or started but never finished. The job channel is
/// in-memory, so nothing else would ever pick them up again.
pub fn recover_interrupted_tasks(storage: &dyn StorageBackend) -> anyhow::Result<i64> {
    let recovered = storage.fail_interrupted_tasks(INTERRUPTED_TASK_ERROR, now_ts())?;
    if recovered > 0 {
        warn!("marked {recovered} interrupted task(s) failed");
    }
    Ok(recovered)
}

async fn worker_loop(
    index: usize,
    receiver: Arc<Mutex<mpsc::Receiver<TaskJob>>>,
    worker: Arc<TaskWorker>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("task worker {index} started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut rx = receiver.lock().await;
        let job = tokio::select! {
            job = rx.recv() => job,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    None
                } else {
                    continue;
                }
            }
        };
        drop(rx);
        let Some(job) = job else {
            break;
        };
        worker.process(job).await;
    }
    info!("task worker {index} stopped");
}

pub struct TaskWorker {
    storage: Arc<dyn StorageBackend>,
    executor: Arc<TaskExecutor>,
    timeout: Duration,
}

impl TaskWorker {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        executor: Arc<TaskExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            executor,
            timeout,
        }
    }

    pub async fn process(&self, job: TaskJob) {
        let task_id = job.task_id;
        let mut task = match run_storage(&self.storage, move |storage| storage.get_task(task_id))
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("job {} skipped: task {task_id} not found", job.job_id);
                return;
            }
            Err(err) => {
                error!("job {} load task {task_id} failed: {err}", job.job_id);
                return;
            }
        };
        if task.job_id.as_deref() != Some(job.job_id.as_str()) {
            info!("job {} skipped: task {task_id} was re-queued", job.job_id);
            return;
        }

        let agent = self.executor.resolve_agent(&task);
        let started_at = now_ts();
        let job_id = job.job_id.clone();
        let agent_name = agent.name;
        match run_storage(&self.storage, move |storage| {
            storage.mark_task_started(task_id, &job_id, started_at, agent_name)
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("job {} skipped: task {task_id} was re-queued", job.job_id);
                return;
            }
            Err(err) => {
                error!("task {task_id} start update failed: {err}");
                return;
            }
        }
        task.status = TASK_STATUS_IN_PROGRESS.to_string();
        task.started_at = Some(started_at);
        if task.agent_name.is_none() {
            task.agent_name = Some(agent.name.to_string());
        }
        info!("task {task_id} started with agent {}", agent.name);

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.executor.execute(&task)).await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => {
                let message = format!("Task timed out after {} seconds", self.timeout.as_secs());
                let reason = message.clone();
                match run_storage(&self.storage, move |storage| {
                    storage.fail_open_subtasks(task_id, &reason, now_ts())
                })
                .await
                {
                    Ok(0) => {}
                    Ok(count) => info!("task {task_id} timeout failed {count} open subtask(s)"),
                    Err(err) => warn!("task {task_id} subtask cleanup failed: {err}"),
                }
                Err(message)
            }
        };
        let finished = now_ts();
        let execution_time = started.elapsed().as_secs_f64();
        task.execution_time = Some(execution_time);
        let (memory, outcome) = match outcome {
            Ok(result) => {
                info!("task {task_id} completed in {execution_time:.2}s");
                let memory = memory_record(&task, agent.name, "success", &result, finished);
                let outcome = TaskOutcome {
                    task_id,
                    job_id: job.job_id.clone(),
                    status: TASK_STATUS_COMPLETED.to_string(),
                    result: Some(result),
                    error: None,
                    execution_time,
                    completed_at: finished,
                };
                (memory, outcome)
            }
            Err(message) => {
                warn!("task {task_id} failed: {message}");
                let memory = memory_record(
                    &task,
                    agent.name,
                    "error",
                    &json!({ "error": message }),
                    finished,
                );
                let outcome = TaskOutcome {
                    task_id,
                    job_id: job.job_id.clone(),
                    status: TASK_STATUS_FAILED.to_string(),
                    result: None,
                    error: Some(message),
                    execution_time,
                    completed_at: finished,
                };
                (memory, outcome)
            }
        };
        // Memory lands before the terminal status so readers never see one without the other.
        if let Err(err) = run_storage(&self.storage, move |storage| {
            storage.insert_agent_memory(&memory).map(|_| ())
        })
        .await
        {
            warn!("task {task_id} memory write failed: {err}");
        }
        match run_storage(&self.storage, move |storage| storage.finish_task(&outcome)).await {
            Ok(true) => {}
            Ok(false) => info!("task {task_id} was re-queued while job {} ran", job.job_id),
            Err(err) => error!("task {task_id} final update failed: {err}"),
        }
    }
}

fn memory_record(
    task: &TaskRecord,
    agent: &str,
    memory_type: &str,
    outcome: &Value,
    now: f64,
) -> AgentMemoryRecord {
    let summary = outcome
        .get("content")
        .or_else(|| outcome.get("error"))
        .and_then(Value::as_str)
        .map(|text| crate::services::llm::truncate_text(text, MEMORY_SUMMARY_CHARS))
        .unwrap_or_default();
    let mut tags = vec![format!("task:{}", task.id)];
    if let Some(task_type) = task.task_type.as_deref().filter(|value| !value.is_empty()) {
        tags.push(task_type.to_string());
    }
    AgentMemoryRecord {
        id: 0,
        agent_name: agent.to_string(),
        memory_type: memory_type.to_string(),
        content: json!({
            "task_id": task.id,
            "title": task.title,
            "query": task.query,
            "summary": summary,
            "execution_time": task.execution_time,
        }),
        context_tags: tags,
        relevance_score: if memory_type == "success" { 1.0 } else { 0.5 },
        access_count: 0,
        created_at: now,
        accessed_at: None,
    }
}
