//! Cooperative stop signal shared between the orchestrator and a running fetch

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::error_handling::DownloadError;
use crate::core::models::DownloadTask;

const RUNNING: u8 = 0;
const PAUSED: u8 = 1;
const CANCELLED: u8 = 2;

/// How a fetch run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed,
    Paused,
    Cancelled,
}

/// Stop flag plus a wake-up for anything parked on network I/O.
///
/// The first request wins: once paused, a later cancel is ignored and vice versa.
#[derive(Debug, Default)]
pub struct TaskControl {
    state: AtomicU8,
    notify: Notify,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) -> bool {
        self.request(PAUSED)
    }

    pub fn cancel(&self) -> bool {
        self.request(CANCELLED)
    }

    fn request(&self, next: u8) -> bool {
        let changed = self
            .state
            .compare_exchange(RUNNING, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            self.notify.notify_waiters();
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PAUSED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    /// Outcome to report if the run stops now, `None` while still running
    pub fn stop_outcome(&self) -> Option<FetchOutcome> {
        match self.state.load(Ordering::SeqCst) {
            PAUSED => Some(FetchOutcome::Paused),
            CANCELLED => Some(FetchOutcome::Cancelled),
            _ => None,
        }
    }

    /// Resolves once pause or cancel has been requested
    pub async fn interrupted(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 先注册再检查，避免错过通知
            notified.as_mut().enable();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

/// One way of moving a task's bytes to disk
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Run until done, paused or cancelled. Errors carry retryability for the orchestrator.
    async fn run(
        &self,
        task: DownloadTask,
        control: Arc<TaskControl>,
    ) -> Result<FetchOutcome, DownloadError>;
}
