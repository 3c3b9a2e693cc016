//! Application configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::{RetryPolicy, MAX_RETRY_ATTEMPTS};
use crate::utils::network::DEFAULT_USER_AGENT;

/// Main application configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Download engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks allowed in DOWNLOADING at once (N)
    pub max_concurrent_tasks: usize,
    /// Segment fetches in flight across all HLS tasks (M)
    pub segment_workers: usize,
    pub task_retry_attempts: u32,
    pub task_retry_base_delay_ms: u64,
    /// Attempts per segment before the run gives up
    pub segment_retry_budget: u32,
    pub fetch_retry_attempts: u32,
    pub fetch_retry_base_delay_ms: u64,
    pub progress_interval_ms: u64,
    pub speed_sample_count: usize,
    pub buffer_size: usize,
    /// Connect timeout and per-read stall timeout
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub download_dir: String,
    /// Treat AES failures as hard errors instead of keeping raw bytes
    pub strict_decryption: bool,
    pub connectivity_probe_url: Option<String>,
    /// Minimum percent step for list-view progress updates
    pub list_progress_min_delta: f64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String, // "error", "warn", "info", "debug", "trace"
    pub show_target: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            segment_workers: 3,
            task_retry_attempts: 3,
            task_retry_base_delay_ms: 3000,
            segment_retry_budget: 5,
            fetch_retry_attempts: 3,
            fetch_retry_base_delay_ms: 500,
            progress_interval_ms: 800,
            speed_sample_count: 5,
            buffer_size: 8192,
            timeout_seconds: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            download_dir: "downloads".to_string(),
            strict_decryption: true,
            connectivity_probe_url: None,
            list_progress_min_delta: 1.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
        }
    }
}

impl EngineConfig {
    pub fn task_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.task_retry_attempts,
            Duration::from_millis(self.task_retry_base_delay_ms),
        )
    }

    pub fn fetch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_retry_attempts,
            Duration::from_millis(self.fetch_retry_base_delay_ms),
        )
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl AppConfig {
    /// Load configuration from the default location, creating it if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `path`, writing defaults there if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let config: AppConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

            config
                .validate()
                .with_context(|| format!("Invalid configuration in {:?}", config_path))?;

            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = self.export()?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "mediadownloader", "engine")
            .with_context(|| "Failed to get project directories")
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.json"))
    }

    /// Get the application data directory (task store lives here)
    pub fn get_data_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }

    /// Export configuration as JSON string
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "Failed to export configuration")
    }

    /// Parse and validate configuration from a JSON string
    pub fn import(json: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(json).with_context(|| "Failed to parse imported configuration")?;

        config
            .validate()
            .with_context(|| "Imported configuration is invalid")?;

        tracing::info!("Imported and validated configuration from JSON");
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;

        if engine.max_concurrent_tasks == 0 {
            anyhow::bail!("Concurrent tasks must be greater than 0");
        }

        if engine.segment_workers == 0 {
            anyhow::bail!("Segment workers must be greater than 0");
        }

        if engine.task_retry_attempts > MAX_RETRY_ATTEMPTS
            || engine.segment_retry_budget > MAX_RETRY_ATTEMPTS
            || engine.fetch_retry_attempts > MAX_RETRY_ATTEMPTS
        {
            anyhow::bail!("Retry attempts should not exceed {}", MAX_RETRY_ATTEMPTS);
        }

        if engine.segment_retry_budget == 0 || engine.fetch_retry_attempts == 0 {
            anyhow::bail!("Segment and fetch retry budgets must be at least 1");
        }

        if engine.progress_interval_ms == 0 {
            anyhow::bail!("Progress interval must be greater than 0");
        }

        if engine.speed_sample_count == 0 || engine.buffer_size == 0 {
            anyhow::bail!("Speed samples and buffer size must be greater than 0");
        }

        if engine.timeout_seconds == 0 || engine.timeout_seconds > 300 {
            anyhow::bail!("Timeout should be between 1 and 300 seconds");
        }

        if engine.user_agent.trim().is_empty() {
            anyhow::bail!("User agent must not be empty");
        }

        if engine.list_progress_min_delta < 0.0 {
            anyhow::bail!("List progress delta must not be negative");
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_concurrent_tasks, 2);
        assert_eq!(config.engine.segment_workers, 3);
        assert_eq!(config.engine.user_agent, "Mozilla/5.0");
        assert!(config.engine.strict_decryption);
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let json = config.export().unwrap();
        let parsed_config = AppConfig::import(&json).unwrap();
        assert_eq!(config, parsed_config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AppConfig::import(r#"{"engine":{"max_concurrent_tasks":4}}"#).unwrap();
        assert_eq!(config.engine.max_concurrent_tasks, 4);
        assert_eq!(config.engine.segment_retry_budget, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut config = AppConfig::default();
        config.engine.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.engine.segment_workers = 0;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.engine.task_retry_attempts = 11;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.engine.timeout_seconds = 301;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.engine.progress_interval_ms = 0;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_defaults_then_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let created = AppConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, AppConfig::default());

        let mut changed = created.clone();
        changed.engine.segment_workers = 6;
        changed.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.engine.segment_workers, 6);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"engine":{"segment_workers":0}}"#).unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_policies_follow_config() {
        let engine = EngineConfig::default();
        let task = engine.task_retry_policy();
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.delay_for_attempt(2), Duration::from_millis(6000));
        assert_eq!(
            engine.fetch_retry_policy().delay_for_attempt(1),
            Duration::from_millis(500)
        );
    }
}
