//! Download orchestrator
//!
//! Runs at most `max_concurrent_tasks` fetches at once, picks the fetcher from the
//! persisted `is_segmented` flag, owns the task-level retry policy and reports when
//! nothing is left to do.
//!
//! Every call arrives either through the runtime router or from a finishing run; the
//! orchestrator never calls back into the router.

use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::control::{FetchOutcome, Fetcher, TaskControl};
use crate::core::downloader::PlainFetcher;
use crate::core::error_handling::{errors, DownloadError, RetryPolicy};
use crate::core::events::{DownloadEvent, EventSink};
use crate::core::http::HttpClient;
use crate::core::m3u8_downloader::{SegmentPool, SegmentedFetcher};
use crate::core::manager::TaskManager;
use crate::core::models::{AppResult, DownloadTask, TaskId, TaskStatus};

/// A fetch in flight. Dropping the entry gives the slot back.
struct RunningTask {
    control: Arc<TaskControl>,
    handle: JoinHandle<()>,
    permit: OwnedSemaphorePermit,
}

pub struct DownloadOrchestrator {
    manager: Arc<TaskManager>,
    http: Arc<dyn HttpClient>,
    events: Arc<dyn EventSink>,
    plain: PlainFetcher,
    segmented: SegmentedFetcher,
    task_slots: Arc<Semaphore>,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    /// Serializes the "already running / capacity" check with the insert
    start_lock: tokio::sync::Mutex<()>,
    retry_policy: RetryPolicy,
    retry_counts: DashMap<TaskId, u32>,
    /// Failed runs waiting out their backoff; still DOWNLOADING in the store
    retry_scheduled: DashSet<TaskId>,
    /// Set while pause_all drains; runs ending meanwhile must not promote WAITING tasks
    draining: AtomicBool,
    idle_tx: watch::Sender<bool>,
}

impl DownloadOrchestrator {
    pub fn new(
        manager: Arc<TaskManager>,
        http: Arc<dyn HttpClient>,
        events: Arc<dyn EventSink>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let plain = PlainFetcher::new(
            Arc::clone(&http),
            Arc::clone(&manager),
            Arc::clone(&events),
            Arc::clone(&config),
        );
        let segmented = SegmentedFetcher::new(
            Arc::clone(&http),
            Arc::clone(&manager),
            Arc::clone(&events),
            Arc::clone(&config),
        );
        let (idle_tx, _) = watch::channel(true);

        info!(
            "🎯 Orchestrator ready: {} task slots, {} segment workers",
            config.max_concurrent_tasks, config.segment_workers
        );

        Self {
            manager,
            http,
            events,
            plain,
            segmented,
            task_slots: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            running: Mutex::new(HashMap::new()),
            start_lock: tokio::sync::Mutex::new(()),
            retry_policy: config.task_retry_policy(),
            retry_counts: DashMap::new(),
            retry_scheduled: DashSet::new(),
            draining: AtomicBool::new(false),
            idle_tx,
        }
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running.lock().contains_key(&task_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.running.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn available_slots(&self) -> usize {
        self.task_slots.available_permits()
    }

    pub fn segment_pool(&self) -> &SegmentPool {
        self.segmented.pool()
    }

    /// Restarts already used by a task since its last terminal outcome
    pub fn retry_count(&self, task_id: TaskId) -> u32 {
        self.retry_counts.get(&task_id).map(|c| *c).unwrap_or(0)
    }

    /// `true` whenever nothing is running, waiting or scheduled for a retry
    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }

    pub async fn wait_until_idle(&self) {
        let mut rx = self.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Start `task_id` if it is startable and a slot is free.
    ///
    /// Returns `Ok(false)` without side effects when it is already running, not in a
    /// startable status, or every slot is taken.
    pub async fn start(self: &Arc<Self>, task_id: TaskId) -> AppResult<bool> {
        let _guard = self.start_lock.lock().await;

        if self.is_running(task_id) {
            debug!("Task {} is already running", task_id);
            return Ok(false);
        }

        let task = self.manager.get_task(task_id).await?;
        if !task.can_start() {
            debug!("Task {} cannot start from {}", task_id, task.status);
            return Ok(false);
        }

        let permit = match Arc::clone(&self.task_slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let reason = errors::capacity_error(format!(
                    "all task slots busy, task {} stays {}",
                    task_id, task.status
                ));
                debug!("{}", reason);
                return Ok(false);
            }
        };

        self.retry_scheduled.remove(&task_id);
        let task = self
            .manager
            .set_status(task_id, TaskStatus::Downloading)
            .await?;
        self.events
            .publish(DownloadEvent::TaskStarted { task_id });
        info!(
            "🚀 Starting download for task {}: {} (segmented: {})",
            task_id, task.file_name, task.is_segmented
        );

        let control = Arc::new(TaskControl::new());
        {
            let mut running = self.running.lock();
            let handle = tokio::spawn(Arc::clone(self).run_task(task, Arc::clone(&control)));
            running.insert(
                task_id,
                RunningTask {
                    control,
                    handle,
                    permit,
                },
            );
            self.idle_tx.send_replace(false);
        }

        Ok(true)
    }

    /// One fetch run plus its terminal bookkeeping
    fn run_task(self: Arc<Self>, task: DownloadTask, control: Arc<TaskControl>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let task_id = task.id;
            let fetcher: &dyn Fetcher = if task.is_segmented {
                &self.segmented
            } else {
                &self.plain
            };

            let result = fetcher.run(task, Arc::clone(&control)).await;
            self.release(task_id, &control);

            match result {
                // 完成优先于暂停请求
                Ok(FetchOutcome::Completed) => self.on_complete(task_id).await,
                Ok(outcome) => debug!("Task {} stopped: {:?}", task_id, outcome),
                Err(e) if control.is_interrupted() => {
                    debug!("Task {} interrupted with error: {}", task_id, e)
                }
                Err(e) => self.on_failed(task_id, e).await,
            }
        })
    }

    /// Drop the running entry of this run; a newer run of the same task keeps its own
    fn release(&self, task_id: TaskId, control: &Arc<TaskControl>) {
        let mut running = self.running.lock();
        let owned = running
            .get(&task_id)
            .map_or(false, |entry| Arc::ptr_eq(&entry.control, control));
        if owned {
            running.remove(&task_id);
        }
    }

    /// Signal the run of `task_id` and wait for it to wind down.
    ///
    /// Returns false when the task was neither running nor waiting out a retry.
    async fn interrupt(&self, task_id: TaskId, cancel: bool) -> bool {
        let entry = self.running.lock().remove(&task_id);
        let was_scheduled = self.retry_scheduled.remove(&task_id).is_some();

        let Some(RunningTask {
            control,
            handle,
            permit,
        }) = entry
        else {
            return was_scheduled;
        };

        if cancel {
            control.cancel();
        } else {
            control.pause();
        }
        if let Err(e) = handle.await {
            warn!("Run of task {} ended abnormally: {}", task_id, e);
        }
        drop(permit);
        true
    }

    async fn mark_paused(&self, task_id: TaskId) -> bool {
        match self.manager.get_task(task_id).await {
            Ok(task) if task.status == TaskStatus::Downloading => {
                match self.manager.set_status(task_id, TaskStatus::Paused).await {
                    Ok(_) => {
                        self.events.publish(DownloadEvent::TaskPaused { task_id });
                        true
                    }
                    Err(e) => {
                        warn!("Failed to persist PAUSED for {}: {}", task_id, e);
                        false
                    }
                }
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Task {} vanished while pausing: {}", task_id, e);
                false
            }
        }
    }

    /// Stop a running task and keep its progress
    pub async fn pause(self: &Arc<Self>, task_id: TaskId) -> AppResult<()> {
        let was_active = self.interrupt(task_id, false).await;
        if self.mark_paused(task_id).await {
            info!("⏸️ Paused task: {}", task_id);
        } else if !was_active {
            debug!("Task {} was not running, nothing to pause", task_id);
        }

        self.start_next_waiting().await;
        self.check_idle().await;
        Ok(())
    }

    /// Stop a task and forget its progress; a stopped run lands in PAUSED
    pub async fn cancel(self: &Arc<Self>, task_id: TaskId) -> AppResult<()> {
        self.interrupt(task_id, true).await;
        self.retry_counts.remove(&task_id);

        let task = self.manager.get_task(task_id).await?;
        if task.status == TaskStatus::Completed {
            debug!("Task {} completed before the cancel landed", task_id);
        } else {
            let task = self.manager.reset_progress(task_id).await?;
            if task.status == TaskStatus::Paused {
                self.events.publish(DownloadEvent::TaskPaused { task_id });
            }
            info!("🛑 Cancelled task {} ({})", task_id, task.status);
        }

        self.start_next_waiting().await;
        self.check_idle().await;
        Ok(())
    }

    /// Stop every running task and persist PAUSED for each; waiting tasks are left alone
    pub async fn pause_all(self: &Arc<Self>) -> AppResult<usize> {
        let mut paused = 0usize;
        self.draining.store(true, Ordering::SeqCst);

        loop {
            let drained: Vec<(TaskId, RunningTask)> = self.running.lock().drain().collect();
            let scheduled: Vec<TaskId> = self.retry_scheduled.iter().map(|id| *id.key()).collect();
            for id in &scheduled {
                self.retry_scheduled.remove(id);
            }
            if drained.is_empty() && scheduled.is_empty() {
                break;
            }

            for (_, entry) in &drained {
                entry.control.pause();
            }

            let mut stopped = scheduled;
            for (task_id, entry) in drained {
                if let Err(e) = entry.handle.await {
                    warn!("Run of task {} ended abnormally: {}", task_id, e);
                }
                drop(entry.permit);
                stopped.push(task_id);
            }

            for task_id in stopped {
                if self.mark_paused(task_id).await {
                    paused += 1;
                }
            }
        }

        self.draining.store(false, Ordering::SeqCst);
        info!("⏸️ Paused {} downloads", paused);
        self.check_idle().await;
        Ok(paused)
    }

    async fn on_complete(self: &Arc<Self>, task_id: TaskId) {
        self.retry_counts.remove(&task_id);

        match self
            .manager
            .set_status(task_id, TaskStatus::Completed)
            .await
        {
            Ok(task) => {
                info!("✅ Download completed: {} -> {}", task.file_name, task.file_path);
                self.events.publish(DownloadEvent::TaskCompleted {
                    task_id,
                    file_path: task.file_path,
                });
            }
            Err(e) => error!("Failed to mark task {} completed: {}", task_id, e),
        }

        self.start_next_waiting().await;
        self.check_idle().await;
    }

    async fn on_failed(self: &Arc<Self>, task_id: TaskId, error: DownloadError) {
        let attempt = {
            let mut count = self.retry_counts.entry(task_id).or_insert(0);
            *count += 1;
            *count
        };

        if error.is_retryable()
            && self.retry_policy.allows(attempt)
            && self.http.is_reachable().await
        {
            let delay = self.retry_policy.delay_for_attempt(attempt);
            self.retry_scheduled.insert(task_id);
            warn!(
                "🔄 Task {} failed (attempt {}/{}), retrying in {:?}: {}",
                task_id, attempt, self.retry_policy.max_attempts, delay, error
            );
            self.events.publish(DownloadEvent::TaskRetrying {
                task_id,
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.fire_scheduled_retry(task_id).await;
            });

            // 退避期间让出槽位
            self.start_next_waiting().await;
            return;
        }

        self.retry_counts.remove(&task_id);
        let message = error.to_string();
        error!("❌ Download failed for task {}: {}", task_id, message);

        if let Err(e) = self.manager.mark_failed(task_id, message.clone()).await {
            error!("Failed to persist failure of task {}: {}", task_id, e);
        }
        self.events.publish(DownloadEvent::TaskFailed {
            task_id,
            error: message,
        });

        self.start_next_waiting().await;
        self.check_idle().await;
    }

    /// Backoff elapsed: requeue as WAITING and try to start right away
    async fn fire_scheduled_retry(self: &Arc<Self>, task_id: TaskId) {
        if self.retry_scheduled.remove(&task_id).is_none() {
            debug!("Retry of task {} was withdrawn", task_id);
            return;
        }

        match self.manager.get_task(task_id).await {
            Ok(task) if task.status == TaskStatus::Downloading => {
                if let Err(e) = self.manager.set_status(task_id, TaskStatus::Waiting).await {
                    warn!("Failed to requeue task {}: {}", task_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Task {} vanished before its retry: {}", task_id, e);
                self.check_idle().await;
                return;
            }
        }

        match self.start(task_id).await {
            Ok(true) => info!("🔁 Retrying task {}", task_id),
            Ok(false) => debug!("Task {} queued for retry", task_id),
            Err(e) => warn!("Failed to retry task {}: {}", task_id, e),
        }
        self.check_idle().await;
    }

    /// Fill free slots with WAITING tasks, oldest first
    async fn start_next_waiting(self: &Arc<Self>) {
        if self.draining.load(Ordering::SeqCst) {
            debug!("Pausing everything, waiting tasks stay queued");
            return;
        }

        let waiting = match self.manager.waiting_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Failed to list waiting tasks: {}", e);
                return;
            }
        };

        for task in waiting {
            if self.task_slots.available_permits() == 0 {
                break;
            }
            if self.is_running(task.id) || self.retry_scheduled.contains(&task.id) {
                continue;
            }
            if let Err(e) = self.start(task.id).await {
                warn!("Failed to start waiting task {}: {}", task.id, e);
            }
        }
    }

    async fn check_idle(&self) {
        let waiting = self
            .manager
            .count_by_status(TaskStatus::Waiting)
            .await
            .unwrap_or(1);
        let downloading = self
            .manager
            .count_by_status(TaskStatus::Downloading)
            .await
            .unwrap_or(1);
        if waiting > 0 || downloading > 0 {
            return;
        }

        let running = self.running.lock();
        if running.is_empty() && self.retry_scheduled.is_empty() {
            if !*self.idle_tx.borrow() {
                info!("💤 No running or waiting tasks, engine idle");
            }
            self.idle_tx.send_replace(true);
        }
    }
}
