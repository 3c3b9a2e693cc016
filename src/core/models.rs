//! Core data models for the download engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error_handling::DownloadError;

/// Stable integer key of a persisted task
pub type TaskId = i64;

/// Task status enumeration
///
/// The numeric codes are what a persisted record stores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Waiting,

    Downloading,

    Paused,

    Completed,

    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Waiting,
        TaskStatus::Downloading,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn code(self) -> u8 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Downloading => 1,
            TaskStatus::Paused => 2,
            TaskStatus::Completed => 3,
            TaskStatus::Failed => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// Legal transitions of the task state machine
    ///
    /// ```text
    /// WAITING     -> DOWNLOADING
    /// DOWNLOADING -> PAUSED | COMPLETED | FAILED | WAITING (scheduled retry, recovery)
    /// PAUSED      -> WAITING | DOWNLOADING
    /// FAILED      -> WAITING | DOWNLOADING
    /// COMPLETED   -> (terminal)
    /// ```
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Waiting, Downloading)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Waiting)
                | (Paused, Waiting)
                | (Paused, Downloading)
                | (Failed, Waiting)
                | (Failed, Downloading)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TaskStatus::Completed
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Persisted download task, one per user request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    /// 0 until the repository assigns a key
    pub id: TaskId,

    pub url: String,

    pub file_name: String,

    /// Absolute or config-relative destination path
    pub file_path: String,

    pub vod_name: String,

    pub episode_name: String,

    pub status: TaskStatus,

    /// 0 until known
    pub total_size: u64,

    pub downloaded_size: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub error_message: Option<String>,

    pub is_segmented: bool,

    pub total_segments: u32,

    pub downloaded_segments: u32,

    // 缓存的媒体播放列表，重启后无需重新拉取
    pub manifest_url: Option<String>,

    pub manifest_content: Option<String>,
}

impl DownloadTask {
    pub fn new(
        url: impl Into<String>,
        vod_name: impl Into<String>,
        episode_name: impl Into<String>,
        file_name: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            url: url.into(),
            file_name: file_name.into(),
            file_path: file_path.into(),
            vod_name: vod_name.into(),
            episode_name: episode_name.into(),
            status: TaskStatus::Waiting,
            total_size: 0,
            downloaded_size: 0,
            created_at: now,
            updated_at: now,
            error_message: None,
            is_segmented: false,
            total_segments: 0,
            downloaded_segments: 0,
            manifest_url: None,
            manifest_content: None,
        }
    }

    /// Attach a resolved media playlist to a new task
    pub fn with_manifest(
        mut self,
        manifest_url: impl Into<String>,
        manifest_content: impl Into<String>,
        total_segments: u32,
    ) -> Self {
        self.is_segmented = true;
        self.manifest_url = Some(manifest_url.into());
        self.manifest_content = Some(manifest_content.into());
        self.total_segments = total_segments;
        self
    }

    /// Percentage in 0..=100, by segments for HLS tasks and by bytes otherwise
    pub fn progress_percent(&self) -> f64 {
        if self.status == TaskStatus::Completed {
            return 100.0;
        }

        let (done, total) = if self.is_segmented {
            (self.downloaded_segments as u64, self.total_segments as u64)
        } else {
            (self.downloaded_size, self.total_size)
        };

        if total == 0 {
            0.0
        } else {
            (done as f64 * 100.0 / total as f64).min(100.0)
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Waiting | TaskStatus::Paused | TaskStatus::Failed
        )
    }

    pub fn can_pause(&self) -> bool {
        self.status == TaskStatus::Downloading
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Application error types

#[derive(Debug, thiserror::Error)]

pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task_id} cannot {action} from status {status}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System error: {0}")]
    System(String),
}

/// Result type alias for application operations

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::Waiting.code(), 0);
        assert_eq!(TaskStatus::Failed.code(), 4);
        assert_eq!(TaskStatus::from_code(9), None);
    }

    #[test]
    fn test_only_resumable_states_enter_downloading() {
        use TaskStatus::*;

        assert!(Waiting.can_transition_to(Downloading));
        assert!(Paused.can_transition_to(Downloading));
        assert!(Failed.can_transition_to(Downloading));
        assert!(!Completed.can_transition_to(Downloading));
    }

    #[test]
    fn test_completed_is_terminal() {
        use TaskStatus::*;

        for next in [Waiting, Downloading, Paused, Failed] {
            assert!(!Completed.can_transition_to(next));
        }
        assert!(Completed.is_terminal());
    }

    #[test]
    fn test_pause_and_resume_paths() {
        use TaskStatus::*;

        assert!(Downloading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Waiting));
        assert!(Failed.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn test_progress_by_bytes() {
        let mut task = DownloadTask::new("http://a/b.mp4", "show", "ep1", "b.mp4", "/tmp/b.mp4");
        assert_eq!(task.progress_percent(), 0.0);

        task.total_size = 200;
        task.downloaded_size = 50;
        assert_eq!(task.progress_percent(), 25.0);
    }

    #[test]
    fn test_progress_by_segments() {
        let mut task = DownloadTask::new("http://a/b.m3u8", "show", "ep1", "b.mp4", "/tmp/b.mp4")
            .with_manifest("http://a/b.m3u8", "#EXTM3U", 8);
        task.downloaded_segments = 2;
        task.downloaded_size = 999;
        assert!(task.is_segmented);
        assert_eq!(task.progress_percent(), 25.0);

        task.status = TaskStatus::Completed;
        assert_eq!(task.progress_percent(), 100.0);
    }

    #[test]
    fn test_start_and_pause_guards() {
        let mut task = DownloadTask::new("http://a/b.mp4", "", "", "b.mp4", "/tmp/b.mp4");
        assert!(task.can_start());
        assert!(!task.can_pause());

        task.status = TaskStatus::Downloading;
        assert!(!task.can_start());
        assert!(task.can_pause());

        task.status = TaskStatus::Completed;
        assert!(!task.can_start());
    }
}
