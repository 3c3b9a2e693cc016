//! Command-line front end: `media-download-engine [--config PATH] [--name VOD] <url>...`
//!
//! Recovers unfinished tasks from the store, queues the given URLs and prints progress
//! until nothing is left. Ctrl-C pauses everything so the next run resumes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use media_download_engine::utils::format::{format_file_size, format_remaining_time, format_speed};
use media_download_engine::utils::logging::init_tracing;
use media_download_engine::{
    AppConfig, DownloadEngine, DownloadEvent, EventReceiver, JsonTaskRepository, ProgressFilter,
    ReqwestClient, NAME, VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "media-download-engine", version, about = "断点续传的媒体/HLS 下载器", long_about = None)]
struct Cli {
    /// 配置文件路径 (默认使用系统配置目录)
    #[arg(long, value_name = "PATH")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// 节目名称，用于生成文件名
    #[arg(long, value_name = "VOD", default_value = "")]
    name: String,

    /// 下载链接 (普通文件或 m3u8)
    #[arg(value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    urls: Vec<String>,
}

fn load_config(path: Option<&PathBuf>) -> AppConfig {
    let loaded = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    match loaded {
        Ok(config) => config,
        Err(err) => {
            // 配置损坏时使用默认值，不覆盖原文件
            eprintln!("Failed to load configuration ({:#}), using defaults", err);
            AppConfig::default()
        }
    }
}

/// Print events until the channel closes
async fn print_events(mut events: EventReceiver, mut filter: ProgressFilter) {
    while let Some(event) = events.recv().await {
        if !filter.admit(&event) {
            continue;
        }

        match event {
            DownloadEvent::TaskAdded {
                task_id, file_name, ..
            } => println!("[{}] ➕ {}", task_id, file_name),
            DownloadEvent::TaskStarted { task_id } => println!("[{}] 🚀 started", task_id),
            DownloadEvent::TaskProgress {
                task_id,
                bytes_done,
                bytes_total,
                speed,
                eta_seconds,
            } => println!(
                "[{}] {} / {}  {}  ETA {}",
                task_id,
                format_file_size(bytes_done),
                format_file_size(bytes_total),
                format_speed(speed),
                format_remaining_time(eta_seconds)
            ),
            DownloadEvent::SegmentProgress {
                task_id,
                segments_done,
                segments_total,
                speed,
            } => println!(
                "[{}] {}/{} segments  {}",
                task_id,
                segments_done,
                segments_total,
                format_speed(speed)
            ),
            DownloadEvent::TaskPaused { task_id } => println!("[{}] ⏸️ paused", task_id),
            DownloadEvent::TaskResumed { task_id } => println!("[{}] ▶️ resumed", task_id),
            DownloadEvent::TaskCompleted { task_id, file_path } => {
                println!("[{}] ✅ {}", task_id, file_path)
            }
            DownloadEvent::TaskFailed { task_id, error } => println!("[{}] ❌ {}", task_id, error),
            DownloadEvent::TaskDeleted { task_id } => println!("[{}] 🗑️ deleted", task_id),
            DownloadEvent::TaskRetrying {
                task_id,
                attempt,
                delay_ms,
            } => println!("[{}] 🔄 retry #{} in {}ms", task_id, attempt, delay_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = load_config(args.config.as_ref());
    init_tracing(&config.logging);

    info!("🚀 Starting {} v{}", NAME, VERSION);

    let engine_config = config.engine.clone();
    let data_dir = AppConfig::get_data_dir().unwrap_or_else(|_| PathBuf::from(&engine_config.download_dir));
    let repository = JsonTaskRepository::open(data_dir.join("tasks.json"))
        .await
        .context("Failed to open task store")?;
    let http = ReqwestClient::new(
        engine_config.timeout(),
        &engine_config.user_agent,
        engine_config.connectivity_probe_url.clone(),
    )
    .context("Failed to build HTTP client")?;

    let filter = ProgressFilter::new(
        engine_config.progress_interval(),
        engine_config.list_progress_min_delta,
    );
    let engine = DownloadEngine::new(engine_config, Arc::new(repository), Arc::new(http));
    let printer = tokio::spawn(print_events(engine.subscribe(), filter));

    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!("🔄 Recovered {} unfinished tasks", recovered);
    }

    for (index, url) in args.urls.iter().enumerate() {
        let episode = (index + 1).to_string();
        if let Err(e) = engine.add_task(url, &args.name, &episode).await {
            warn!("❌ Failed to add {}: {}", url, e);
        }
    }

    tokio::select! {
        _ = engine.wait_until_idle() => info!("✅ All downloads finished"),
        _ = tokio::signal::ctrl_c() => {
            let paused = engine.pause_all().await?;
            info!("⏸️ Interrupted, paused {} downloads", paused);
        }
    }

    // 留出时间输出最后的事件
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();

    let tasks = engine.list_tasks().await?;
    for task in tasks {
        println!(
            "{:>4}  {:<11}  {:>10}  {}",
            task.id,
            task.status.to_string(),
            format_file_size(task.downloaded_size),
            task.file_name
        );
    }

    Ok(())
}
