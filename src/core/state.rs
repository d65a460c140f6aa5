// Application state: builds the shared services once and hands them to the router.

use crate::core::auth::TokenService;
use crate::core::config::Config;
use crate::services::agents::AgentRegistry;
use crate::services::executor::TaskExecutor;
use crate::services::llm::{CompletionBackend, HttpCompletionBackend};
use crate::services::maintenance::{spawn_maintenance, AnalyticsCache};
use crate::services::task_queue::{recover_interrupted_tasks, TaskQueue, TaskWorker};
use crate::services::user_store::UserStore;
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct AppStateInitOptions {
    pub ensure_default_admin: bool,
    pub start_workers: bool,
    pub start_maintenance: bool,
}

impl AppStateInitOptions {
    pub const fn server_default() -> Self {
        Self {
            ensure_default_admin: true,
            start_workers: true,
            start_maintenance: true,
        }
    }

    /// Workers on, periodic jobs off.
    pub const fn test_default() -> Self {
        Self {
            ensure_default_admin: false,
            start_workers: true,
            start_maintenance: false,
        }
    }
}

impl Default for AppStateInitOptions {
    fn default() -> Self {
        Self::server_default()
    }
}

pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageBackend>,
    pub user_store: Arc<UserStore>,
    pub tokens: TokenService,
    pub agents: AgentRegistry,
    pub llm: Arc<dyn CompletionBackend>,
    pub queue: TaskQueue,
    pub analytics: AnalyticsCache,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm.timeout_s.max(1)))
            .build()
            .context("build http client")?;
        let llm: Arc<dyn CompletionBackend> = Arc::new(HttpCompletionBackend::new(http));
        Self::with_parts(config, storage, llm, AppStateInitOptions::server_default())
    }

    pub fn with_parts(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        llm: Arc<dyn CompletionBackend>,
        options: AppStateInitOptions,
    ) -> Result<Self> {
        storage
            .ensure_initialized()
            .context("Failed to initialize storage")?;
        let tokens = TokenService::new(&config.security)?;
        let user_store = Arc::new(UserStore::new(storage.clone()));
        if options.ensure_default_admin
            && config.is_development()
            && config.security.seed_default_admin
        {
            user_store
                .ensure_default_admin()
                .context("Failed to ensure default admin account")?;
        }

        if options.start_workers {
            recover_interrupted_tasks(storage.as_ref())
                .context("Failed to recover interrupted tasks")?;
        }

        let agents = AgentRegistry::new();
        let queue = TaskQueue::new(storage.clone(), config.worker.queue_capacity);
        let analytics: AnalyticsCache = Arc::new(RwLock::new(None));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let has_runtime = tokio::runtime::Handle::try_current().is_ok();
        if (options.start_workers || options.start_maintenance) && !has_runtime {
            warn!("background workers not started: no tokio runtime");
        }
        if options.start_workers && has_runtime {
            let executor = Arc::new(TaskExecutor::new(
                storage.clone(),
                llm.clone(),
                agents,
                config.llm.clone(),
            ));
            let worker = Arc::new(TaskWorker::new(
                storage.clone(),
                executor,
                Duration::from_secs(config.worker.task_timeout_s.max(1)),
            ));
            queue.spawn_workers(worker, config.worker.concurrency, shutdown_rx.clone());
        }
        if options.start_maintenance && has_runtime {
            spawn_maintenance(
                storage.clone(),
                analytics.clone(),
                config.worker.clone(),
                shutdown_rx,
            );
        }

        Ok(Self {
            config: Arc::new(config),
            storage,
            user_store,
            tokens,
            agents,
            llm,
            queue,
            analytics,
            shutdown,
        })
    }

    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }
}
