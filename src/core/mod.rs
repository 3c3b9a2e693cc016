//! Core business logic module
//!
//! Task model and store, the task manager, the orchestrator with its runtime router,
//! both fetchers and the pieces they share (HTTP capability, events, retry, progress).

pub mod config;
pub mod control;
pub mod downloader;
pub mod engine;
pub mod error_handling;
pub mod events;
pub mod http;
pub mod m3u8_downloader;
pub mod manager;
pub mod models;
pub mod orchestrator;
pub mod progress_tracker;
pub mod repository;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_support;



#[cfg(test)]
mod m3u8_integration_tests;



// Re-export commonly used types
pub use config::{AppConfig, EngineConfig};
pub use engine::DownloadEngine;
pub use manager::TaskManager;
pub use orchestrator::DownloadOrchestrator;
