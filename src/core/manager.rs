//! Task Manager - lifecycle of persisted download tasks
//!
//! The manager is the only writer of task records. User-facing operations (create, pause,
//! resume, cancel, delete, recovery) validate against the status state machine and hand
//! scheduling to the orchestrator through the runtime handle. Fetchers and the orchestrator
//! use the mutation primitives, each of which is a locked read-modify-write of one record.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::error_handling::RetryExecutor;
use crate::core::events::{DownloadEvent, EventSink};
use crate::core::http::HttpClient;
use crate::core::m3u8_downloader::{resolve_media_manifest, ResolvedManifest};
use crate::core::models::{AppError, AppResult, DownloadTask, TaskId, TaskStatus};
use crate::core::repository::TaskRepository;
use crate::core::runtime::DownloadRuntimeHandle;
use crate::parsers::m3u8_parser;
use crate::utils::{file_utils, validation};

pub struct TaskManager {
    repository: Arc<dyn TaskRepository>,
    http: Arc<dyn HttpClient>,
    events: Arc<dyn EventSink>,
    runtime: DownloadRuntimeHandle,
    config: Arc<EngineConfig>,
    download_dir: PathBuf,
    task_locks: DashMap<TaskId, Arc<Mutex<()>>>,
    create_lock: Mutex<()>,
}

impl TaskManager {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        http: Arc<dyn HttpClient>,
        events: Arc<dyn EventSink>,
        runtime: DownloadRuntimeHandle,
        config: Arc<EngineConfig>,
    ) -> Self {
        let download_dir = PathBuf::from(&config.download_dir);
        Self {
            repository,
            http,
            events,
            runtime,
            config,
            download_dir,
            task_locks: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Per-task scratch directory for staged segments, named after the timestamped
    /// destination stem so no later task can pick up another task's leftovers
    pub fn staging_dir(task: &DownloadTask) -> PathBuf {
        let destination = Path::new(&task.file_path);
        let parent = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        match destination.file_stem().and_then(|stem| stem.to_str()) {
            Some(stem) if !stem.is_empty() => parent.join(format!(".segments_{}", stem)),
            _ => parent.join(format!(".segments_{}", task.id)),
        }
    }

    /// Create a task for `url` and ask the orchestrator to start it.
    ///
    /// Returns the existing id, without side effects, when the URL is already tracked.
    pub async fn create_task(
        &self,
        url: &str,
        vod_name: &str,
        episode_name: &str,
    ) -> AppResult<TaskId> {
        let url = url.trim();
        validation::validate_url(url)?;

        if let Some(existing) = self.repository.get_by_url(url).await? {
            debug!("Task already exists for {}: {}", url, existing.id);
            return Ok(existing.id);
        }

        let resolved = self.probe_manifest(url).await;

        let file_name = file_utils::generate_file_name(
            vod_name,
            episode_name,
            url,
            resolved.is_some(),
            Utc::now().timestamp_millis(),
        );
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let file_path = self.download_dir.join(&file_name);

        let mut task = DownloadTask::new(
            url,
            vod_name,
            episode_name,
            file_name.clone(),
            file_path.to_string_lossy(),
        );
        if let Some(resolved) = resolved {
            let segment_count = resolved.segment_count();
            task = task.with_manifest(resolved.url, resolved.text, segment_count);
        }
        let is_segmented = task.is_segmented;

        let id = {
            let _guard = self.create_lock.lock().await;
            // 探测期间可能已有同 URL 任务写入
            if let Some(existing) = self.repository.get_by_url(url).await? {
                return Ok(existing.id);
            }
            self.repository.insert(task).await?
        };

        info!("➕ Created task {}: {} ({})", id, file_name, url);
        self.events.publish(DownloadEvent::TaskAdded {
            task_id: id,
            file_name,
            is_segmented,
        });

        self.runtime.start_task(id).await?;
        Ok(id)
    }

    /// Manifest for `url` if it is (or sniffs like) an HLS playlist; failures degrade to a plain file
    async fn probe_manifest(&self, url: &str) -> Option<ResolvedManifest> {
        let candidate = m3u8_parser::looks_like_manifest_url(url)
            || (file_utils::url_media_extension(url).is_none() && self.sniff_manifest(url).await);
        if !candidate {
            return None;
        }

        let retry = RetryExecutor::new(self.config.fetch_retry_policy());
        match resolve_media_manifest(
            self.http.as_ref(),
            url,
            &self.config.user_agent,
            self.config.timeout(),
            &retry,
            || false,
        )
        .await
        {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                warn!("清单解析失败，按普通文件处理: {} - {}", url, e);
                None
            }
        }
    }

    /// Peek at the first body chunk without downloading the whole resource
    async fn sniff_manifest(&self, url: &str) -> bool {
        let headers = vec![("User-Agent".to_string(), self.config.user_agent.clone())];
        let mut response = match self.http.get(url, &headers).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                debug!("Sniff of {} returned HTTP {}", url, response.status);
                return false;
            }
            Err(e) => {
                debug!("Sniff of {} failed: {}", url, e);
                return false;
            }
        };

        if response
            .header("content-type")
            .map_or(false, |ct| ct.to_ascii_lowercase().contains("mpegurl"))
        {
            return true;
        }

        match tokio::time::timeout(self.config.timeout(), response.body.next()).await {
            Ok(Some(Ok(chunk))) => {
                m3u8_parser::looks_like_manifest_content(&String::from_utf8_lossy(&chunk))
            }
            _ => false,
        }
    }

    pub async fn pause(&self, id: TaskId) -> AppResult<()> {
        let task = self.get_task(id).await?;
        if !task.can_pause() {
            return Err(AppError::InvalidState {
                task_id: id,
                status: task.status,
                action: "pause",
            });
        }
        self.runtime.pause_task(id).await
    }

    /// PAUSED or FAILED back to WAITING, then ask for a start
    pub async fn resume(&self, id: TaskId) -> AppResult<()> {
        let task = self.get_task(id).await?;
        if !task.can_start() {
            return Err(AppError::InvalidState {
                task_id: id,
                status: task.status,
                action: "resume",
            });
        }

        if task.status != TaskStatus::Waiting {
            self.set_status(id, TaskStatus::Waiting).await?;
            self.events.publish(DownloadEvent::TaskResumed { task_id: id });
            info!("▶️ Resumed task: {}", id);
        }

        self.runtime.start_task(id).await?;
        Ok(())
    }

    /// Stop without keeping progress; the task stays resumable from zero
    pub async fn cancel(&self, id: TaskId) -> AppResult<()> {
        let task = self.get_task(id).await?;
        if task.status == TaskStatus::Completed {
            return Err(AppError::InvalidState {
                task_id: id,
                status: task.status,
                action: "cancel",
            });
        }
        self.runtime.cancel_task(id).await
    }

    pub async fn delete(&self, id: TaskId, delete_file: bool) -> AppResult<()> {
        let task = self.get_task(id).await?;

        // 如果正在下载，先暂停
        if task.status == TaskStatus::Downloading {
            self.runtime.pause_task(id).await?;
        }

        if delete_file {
            self.remove_artifacts(&task).await;
        }

        self.repository.delete_by_id(id).await?;
        self.task_locks.remove(&id);
        self.events.publish(DownloadEvent::TaskDeleted { task_id: id });
        info!("🗑️ Deleted task {} (files removed: {})", id, delete_file);
        Ok(())
    }

    /// Re-enqueue tasks left WAITING or DOWNLOADING by an abnormal stop
    pub async fn recover_unfinished(&self) -> AppResult<usize> {
        let tasks = self.pending_tasks().await?;
        let mut recovered = 0usize;

        for task in tasks {
            if task.status == TaskStatus::Downloading {
                self.set_status(task.id, TaskStatus::Waiting).await?;
            }
            match self.runtime.start_task(task.id).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!("Failed to re-enqueue task {}: {}", task.id, e),
            }
        }

        if recovered > 0 {
            info!("Recovered {} unfinished tasks", recovered);
        }
        Ok(recovered)
    }

    pub async fn list_tasks(&self) -> AppResult<Vec<DownloadTask>> {
        self.repository.get_all().await
    }

    pub async fn get_task(&self, id: TaskId) -> AppResult<DownloadTask> {
        self.repository
            .get_by_id(id)
            .await?
            .ok_or(AppError::TaskNotFound(id))
    }

    /// WAITING and DOWNLOADING tasks, oldest first
    pub async fn pending_tasks(&self) -> AppResult<Vec<DownloadTask>> {
        self.repository
            .get_by_statuses(&[TaskStatus::Waiting, TaskStatus::Downloading])
            .await
    }

    pub async fn waiting_tasks(&self) -> AppResult<Vec<DownloadTask>> {
        self.repository.get_by_statuses(&[TaskStatus::Waiting]).await
    }

    pub async fn count_by_status(&self, status: TaskStatus) -> AppResult<usize> {
        self.repository.count_by_status(status).await
    }

    fn task_lock(&self, id: TaskId) -> Arc<Mutex<()>> {
        self.task_locks.entry(id).or_default().clone()
    }

    async fn mutate<F>(&self, id: TaskId, f: F) -> AppResult<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask) -> AppResult<()> + Send,
    {
        let lock = self.task_lock(id);
        let _guard = lock.lock().await;

        let mut task = self.get_task(id).await?;
        f(&mut task)?;
        task.touch();
        self.repository.update(&task).await?;
        Ok(task)
    }

    pub async fn set_status(&self, id: TaskId, status: TaskStatus) -> AppResult<DownloadTask> {
        self.mutate(id, |task| {
            if !task.status.can_transition_to(status) {
                return Err(AppError::InvalidState {
                    task_id: task.id,
                    status: task.status,
                    action: "transition",
                });
            }
            if task.status == TaskStatus::Failed && status != TaskStatus::Failed {
                task.error_message = None;
            }
            task.status = status;
            Ok(())
        })
        .await
    }

    /// Bytes written so far; raises the total if the server under-reported it
    pub async fn set_progress(&self, id: TaskId, downloaded: u64) -> AppResult<DownloadTask> {
        self.mutate(id, |task| {
            task.downloaded_size = downloaded;
            if task.total_size > 0 && downloaded > task.total_size {
                task.total_size = downloaded;
            }
            Ok(())
        })
        .await
    }

    pub async fn set_segment_progress(&self, id: TaskId, completed: u32) -> AppResult<DownloadTask> {
        self.mutate(id, |task| {
            task.downloaded_segments = if task.total_segments > 0 {
                completed.min(task.total_segments)
            } else {
                completed
            };
            Ok(())
        })
        .await
    }

    pub async fn set_total_size(&self, id: TaskId, total: u64) -> AppResult<DownloadTask> {
        self.mutate(id, |task| {
            task.total_size = total.max(task.downloaded_size);
            Ok(())
        })
        .await
    }

    pub async fn set_error(&self, id: TaskId, message: impl Into<String> + Send) -> AppResult<DownloadTask> {
        let message = message.into();
        self.mutate(id, |task| {
            task.error_message = Some(message);
            Ok(())
        })
        .await
    }

    /// FAILED plus the cause in a single write
    pub async fn mark_failed(&self, id: TaskId, message: impl Into<String> + Send) -> AppResult<DownloadTask> {
        let message = message.into();
        self.mutate(id, |task| {
            if !task.status.can_transition_to(TaskStatus::Failed) {
                return Err(AppError::InvalidState {
                    task_id: task.id,
                    status: task.status,
                    action: "fail",
                });
            }
            task.status = TaskStatus::Failed;
            task.error_message = Some(message);
            Ok(())
        })
        .await
    }

    /// Replace the cached media playlist (after variant resolution or a refetch)
    pub async fn set_manifest(
        &self,
        id: TaskId,
        manifest_url: &str,
        manifest_text: &str,
        total_segments: u32,
    ) -> AppResult<DownloadTask> {
        let (url, text) = (manifest_url.to_string(), manifest_text.to_string());
        self.mutate(id, move |task| {
            task.is_segmented = true;
            task.manifest_url = Some(url);
            task.manifest_content = Some(text);
            task.total_segments = total_segments;
            task.downloaded_segments = task.downloaded_segments.min(total_segments);
            Ok(())
        })
        .await
    }

    /// Forget all progress after a cancel; a stopped run lands in PAUSED
    pub async fn reset_progress(&self, id: TaskId) -> AppResult<DownloadTask> {
        let task = self.get_task(id).await?;
        self.remove_artifacts(&task).await;

        self.mutate(id, |task| {
            task.downloaded_size = 0;
            task.downloaded_segments = 0;
            task.total_size = 0;
            if task.status.can_transition_to(TaskStatus::Paused) {
                task.status = TaskStatus::Paused;
            }
            Ok(())
        })
        .await
    }

    /// Destination file and staging directory, best effort
    async fn remove_artifacts(&self, task: &DownloadTask) {
        let file_path = Path::new(&task.file_path);
        if tokio::fs::try_exists(file_path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_file(file_path).await {
                warn!("Failed to remove {:?}: {}", file_path, e);
            }
        }

        let staging = Self::staging_dir(task);
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                warn!("Failed to remove staging dir {:?}: {}", staging, e);
            }
        }
    }
}
