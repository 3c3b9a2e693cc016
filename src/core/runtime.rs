//! Download runtime command router.
//!
//! A thin async command queue that serializes download control calls onto the
//! orchestrator. The task manager only ever holds the handle, never the orchestrator.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument};

use crate::core::models::{AppError, AppResult, TaskId};
use crate::core::orchestrator::DownloadOrchestrator;

/// One control call, answered through its oneshot
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Replies `true` when the task actually started
    Start {
        task_id: TaskId,
        respond_to: oneshot::Sender<AppResult<bool>>,
    },
    Pause {
        task_id: TaskId,
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    Cancel {
        task_id: TaskId,
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    PauseAll {
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
}

/// Cloneable sender side; every call waits for the orchestrator's answer
#[derive(Clone)]
pub struct DownloadRuntimeHandle {
    sender: mpsc::Sender<RuntimeCommand>,
}

impl DownloadRuntimeHandle {
    pub fn new(sender: mpsc::Sender<RuntimeCommand>) -> Self {
        Self { sender }
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> RuntimeCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| AppError::System(format!("Download runtime unavailable: {}", e)))?;
        rx.await
            .map_err(|_| AppError::System("Download runtime dropped response".into()))?
    }

    pub async fn start_task(&self, task_id: TaskId) -> AppResult<bool> {
        self.send_command(|tx| RuntimeCommand::Start {
            task_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn pause_task(&self, task_id: TaskId) -> AppResult<()> {
        self.send_command(|tx| RuntimeCommand::Pause {
            task_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> AppResult<()> {
        self.send_command(|tx| RuntimeCommand::Cancel {
            task_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn pause_all(&self) -> AppResult<usize> {
        self.send_command(|tx| RuntimeCommand::PauseAll { respond_to: tx })
            .await
    }
}

/// Handle plus the receiving end; the router is spawned once the orchestrator exists
pub fn create_download_runtime_handle() -> (DownloadRuntimeHandle, mpsc::Receiver<RuntimeCommand>) {
    let (tx, rx) = mpsc::channel(256);
    debug!("🔌 Runtime channel created");
    (DownloadRuntimeHandle::new(tx), rx)
}

pub fn spawn_router_loop(
    orchestrator: Arc<DownloadOrchestrator>,
    rx: mpsc::Receiver<RuntimeCommand>,
) -> tokio::task::JoinHandle<()> {
    info!("🔀 Runtime router started");
    tokio::spawn(router_loop(orchestrator, rx))
}

async fn router_loop(
    orchestrator: Arc<DownloadOrchestrator>,
    mut rx: mpsc::Receiver<RuntimeCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        handle_command(&orchestrator, cmd).await;
    }
    info!("Runtime router stopped: all handles dropped");
}

#[instrument(skip(orchestrator, command), fields(?command))]
async fn handle_command(orchestrator: &Arc<DownloadOrchestrator>, command: RuntimeCommand) {
    match command {
        RuntimeCommand::Start {
            task_id,
            respond_to,
        } => {
            let result = orchestrator.start(task_id).await;
            debug!("start {} -> {:?}", task_id, result.as_ref().ok());
            let _ = respond_to.send(result);
        }
        RuntimeCommand::Pause {
            task_id,
            respond_to,
        } => {
            let result = orchestrator.pause(task_id).await;
            debug!("pause {} -> ok: {}", task_id, result.is_ok());
            let _ = respond_to.send(result);
        }
        RuntimeCommand::Cancel {
            task_id,
            respond_to,
        } => {
            let result = orchestrator.cancel(task_id).await;
            let _ = respond_to.send(result);
        }
        RuntimeCommand::PauseAll { respond_to } => {
            let result = orchestrator.pause_all().await;
            let _ = respond_to.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_reports_closed_router() {
        let (handle, rx) = create_download_runtime_handle();
        drop(rx);

        let err = handle.start_task(1).await.unwrap_err();
        assert!(matches!(err, AppError::System(_)));
    }

    #[tokio::test]
    async fn test_handle_reports_dropped_response() {
        let (handle, mut rx) = create_download_runtime_handle();
        tokio::spawn(async move {
            // 丢弃应答通道
            while let Some(cmd) = rx.recv().await {
                drop(cmd);
            }
        });

        let err = handle.pause_all().await.unwrap_err();
        assert!(matches!(err, AppError::System(_)));
    }
}
