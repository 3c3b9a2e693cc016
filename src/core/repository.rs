//! Persisted task store
//!
//! The engine only talks to [`TaskRepository`]. Two implementations ship with the crate:
//! an in-memory store for tests and embedders with their own persistence, and a JSON
//! file store that survives process restarts.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::models::{AppError, AppResult, DownloadTask, TaskId, TaskStatus};

/// Key-indexed task store; URL is unique among stored tasks
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Store a new task and return its assigned id
    async fn insert(&self, task: DownloadTask) -> AppResult<TaskId>;

    async fn update(&self, task: &DownloadTask) -> AppResult<()>;

    async fn delete_by_id(&self, id: TaskId) -> AppResult<()>;

    async fn get_by_id(&self, id: TaskId) -> AppResult<Option<DownloadTask>>;

    async fn get_by_url(&self, url: &str) -> AppResult<Option<DownloadTask>>;

    /// Tasks in any of `statuses`, oldest first
    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> AppResult<Vec<DownloadTask>>;

    async fn count_by_status(&self, status: TaskStatus) -> AppResult<usize>;

    /// Every task, newest first
    async fn get_all(&self) -> AppResult<Vec<DownloadTask>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RepositoryState {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, DownloadTask>,
}

impl RepositoryState {
    fn insert(&mut self, mut task: DownloadTask) -> AppResult<TaskId> {
        if self.tasks.values().any(|t| t.url == task.url) {
            return Err(AppError::Repository(format!(
                "task with url already exists: {}",
                task.url
            )));
        }

        self.next_id = self.next_id.max(1);
        let id = self.next_id;
        self.next_id += 1;

        task.id = id;
        self.tasks.insert(id, task);
        Ok(id)
    }

    fn update(&mut self, task: &DownloadTask) -> AppResult<()> {
        match self.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(AppError::TaskNotFound(task.id)),
        }
    }

    fn by_statuses(&self, statuses: &[TaskStatus]) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    fn all_newest_first(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }
}

/// Process-local task store
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored records; ids at or below `next_id` are never issued again
    fn from_parts(next_id: TaskId, tasks: Vec<DownloadTask>) -> Self {
        let next_id = next_id.max(tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1);
        let tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
        Self {
            state: RwLock::new(RepositoryState { next_id, tasks }),
        }
    }

    fn snapshot(&self) -> StoreFile {
        let state = self.state.read();
        StoreFile::Versioned {
            next_id: state.next_id.max(1),
            tasks: state.tasks.values().cloned().collect(),
        }
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: DownloadTask) -> AppResult<TaskId> {
        self.state.write().insert(task)
    }

    async fn update(&self, task: &DownloadTask) -> AppResult<()> {
        self.state.write().update(task)
    }

    async fn delete_by_id(&self, id: TaskId) -> AppResult<()> {
        self.state.write().tasks.remove(&id);
        Ok(())
    }

    async fn get_by_id(&self, id: TaskId) -> AppResult<Option<DownloadTask>> {
        Ok(self.state.read().tasks.get(&id).cloned())
    }

    async fn get_by_url(&self, url: &str) -> AppResult<Option<DownloadTask>> {
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .find(|t| t.url == url)
            .cloned())
    }

    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> AppResult<Vec<DownloadTask>> {
        Ok(self.state.read().by_statuses(statuses))
    }

    async fn count_by_status(&self, status: TaskStatus) -> AppResult<usize> {
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .count())
    }

    async fn get_all(&self) -> AppResult<Vec<DownloadTask>> {
        Ok(self.state.read().all_newest_first())
    }
}

/// On-disk layout; bare task arrays are still read
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoreFile {
    Versioned {
        next_id: TaskId,
        tasks: Vec<DownloadTask>,
    },
    Legacy(Vec<DownloadTask>),
}

impl StoreFile {
    fn into_parts(self) -> (TaskId, Vec<DownloadTask>) {
        match self {
            StoreFile::Versioned { next_id, tasks } => (next_id, tasks),
            StoreFile::Legacy(tasks) => (1, tasks),
        }
    }

    fn len(&self) -> usize {
        match self {
            StoreFile::Versioned { tasks, .. } | StoreFile::Legacy(tasks) => tasks.len(),
        }
    }
}

/// Task store flushed to a JSON file after every write
pub struct JsonTaskRepository {
    path: PathBuf,
    inner: InMemoryTaskRepository,
    flush_lock: Mutex<()>,
}

impl JsonTaskRepository {
    /// Open the store at `path`, loading existing records if the file exists
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();

        let stored = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                StoreFile::Legacy(Vec::new())
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    AppError::Repository(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
        } else {
            StoreFile::Legacy(Vec::new())
        };

        info!("Loaded {} tasks from: {:?}", stored.len(), path);
        let (next_id, tasks) = stored.into_parts();

        Ok(Self {
            path,
            inner: InMemoryTaskRepository::from_parts(next_id, tasks),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> AppResult<()> {
        let _guard = self.flush_lock.lock().await;

        let stored = self.inner.snapshot();
        let content = serde_json::to_string_pretty(&stored)
            .map_err(|e| AppError::Repository(format!("Failed to serialize tasks: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!("Flushed {} tasks to {:?}", stored.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for JsonTaskRepository {
    async fn insert(&self, task: DownloadTask) -> AppResult<TaskId> {
        let id = self.inner.insert(task).await?;
        self.flush().await?;
        Ok(id)
    }

    async fn update(&self, task: &DownloadTask) -> AppResult<()> {
        self.inner.update(task).await?;
        self.flush().await
    }

    async fn delete_by_id(&self, id: TaskId) -> AppResult<()> {
        self.inner.delete_by_id(id).await?;
        self.flush().await
    }

    async fn get_by_id(&self, id: TaskId) -> AppResult<Option<DownloadTask>> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_url(&self, url: &str) -> AppResult<Option<DownloadTask>> {
        self.inner.get_by_url(url).await
    }

    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> AppResult<Vec<DownloadTask>> {
        self.inner.get_by_statuses(statuses).await
    }

    async fn count_by_status(&self, status: TaskStatus) -> AppResult<usize> {
        self.inner.count_by_status(status).await
    }

    async fn get_all(&self) -> AppResult<Vec<DownloadTask>> {
        self.inner.get_all().await
    }
}
