use crate::core::config::LoggingConfig;

/// Install the global fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("media_download_engine={}", config.level).into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.show_target)
        .try_init();
}
