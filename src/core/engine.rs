//! Engine wiring
//!
//! Builds the event bus, runtime router, task manager and orchestrator once and hands
//! out references. Must be constructed inside a tokio runtime.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::config::EngineConfig;
use crate::core::events::{EventBus, EventReceiver, EventSink};
use crate::core::http::HttpClient;
use crate::core::manager::TaskManager;
use crate::core::models::{AppResult, DownloadTask, TaskId};
use crate::core::orchestrator::DownloadOrchestrator;
use crate::core::repository::TaskRepository;
use crate::core::runtime::{create_download_runtime_handle, spawn_router_loop, DownloadRuntimeHandle};

pub struct DownloadEngine {
    config: Arc<EngineConfig>,
    events: Arc<EventBus>,
    manager: Arc<TaskManager>,
    orchestrator: Arc<DownloadOrchestrator>,
    runtime: DownloadRuntimeHandle,
    router: JoinHandle<()>,
}

impl DownloadEngine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn TaskRepository>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let sink: Arc<dyn EventSink> = events.clone();

        let (runtime, rx) = create_download_runtime_handle();
        let manager = Arc::new(TaskManager::new(
            repository,
            Arc::clone(&http),
            Arc::clone(&sink),
            runtime.clone(),
            Arc::clone(&config),
        ));
        let orchestrator = Arc::new(DownloadOrchestrator::new(
            Arc::clone(&manager),
            http,
            sink,
            Arc::clone(&config),
        ));
        let router = spawn_router_loop(Arc::clone(&orchestrator), rx);

        info!("Download engine initialized (dir: {})", config.download_dir);
        Self {
            config,
            events,
            manager,
            orchestrator,
            runtime,
            router,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// New observer channel; events published before this call are not replayed
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn orchestrator(&self) -> &Arc<DownloadOrchestrator> {
        &self.orchestrator
    }

    pub fn runtime(&self) -> &DownloadRuntimeHandle {
        &self.runtime
    }

    pub async fn add_task(&self, url: &str, vod_name: &str, episode_name: &str) -> AppResult<TaskId> {
        self.manager.create_task(url, vod_name, episode_name).await
    }

    pub async fn pause(&self, task_id: TaskId) -> AppResult<()> {
        self.manager.pause(task_id).await
    }

    pub async fn resume(&self, task_id: TaskId) -> AppResult<()> {
        self.manager.resume(task_id).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> AppResult<()> {
        self.manager.cancel(task_id).await
    }

    pub async fn delete(&self, task_id: TaskId, delete_file: bool) -> AppResult<()> {
        self.manager.delete(task_id, delete_file).await
    }

    pub async fn pause_all(&self) -> AppResult<usize> {
        self.runtime.pause_all().await
    }

    pub async fn recover(&self) -> AppResult<usize> {
        self.manager.recover_unfinished().await
    }

    pub async fn get_task(&self, task_id: TaskId) -> AppResult<DownloadTask> {
        self.manager.get_task(task_id).await
    }

    pub async fn list_tasks(&self) -> AppResult<Vec<DownloadTask>> {
        self.manager.list_tasks().await
    }

    pub async fn wait_until_idle(&self) {
        self.orchestrator.wait_until_idle().await
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        self.router.abort();
    }
}
