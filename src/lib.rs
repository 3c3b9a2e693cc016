//! Media Download Engine - Core Library
//!
//! Resumable download engine for plain media files and HLS playlists: a persistent
//! task store, a bounded-concurrency orchestrator with retry, byte-range resume and
//! segment-level resume with AES-128 decryption.

pub mod core;
pub mod parsers;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::{AppConfig, EngineConfig, LoggingConfig},
    engine::DownloadEngine,
    error_handling::{DownloadError, ErrorCategory, RetryPolicy},
    events::{DownloadEvent, EventBus, EventReceiver, EventSink},
    http::{HttpClient, HttpResponse, ReqwestClient},
    manager::TaskManager,
    models::{AppError, AppResult, DownloadTask, TaskId, TaskStatus},
    orchestrator::DownloadOrchestrator,
    progress_tracker::ProgressFilter,
    repository::{InMemoryTaskRepository, JsonTaskRepository, TaskRepository},
    runtime::DownloadRuntimeHandle,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize logging with the default configuration
pub fn init() -> anyhow::Result<()> {
    utils::logging::init_tracing(&LoggingConfig::default());
    tracing::info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(init().is_ok());
        // 重复初始化不报错
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "media-download-engine");
    }
}
