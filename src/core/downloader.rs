//! HTTP 单文件下载器
//!
//! 单连接流式下载，支持：
//! - 断点续传（Range 请求）
//! - 进度追踪，按固定间隔上报
//! - 协作式暂停/取消

use async_trait::async_trait;
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::control::{FetchOutcome, Fetcher, TaskControl};
use crate::core::error_handling::{errors, DownloadError};
use crate::core::events::{DownloadEvent, EventSink};
use crate::core::http::{HttpClient, HttpResponse};
use crate::core::manager::TaskManager;
use crate::core::models::{DownloadTask, TaskId};
use crate::core::progress_tracker::{eta_seconds, ProgressThrottle};
use crate::utils::network::{parse_content_range_start, parse_content_range_total, range_from};

/// Plain-file fetcher; one instance serves every non-segmented task
pub struct PlainFetcher {
    http: Arc<dyn HttpClient>,
    manager: Arc<TaskManager>,
    events: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
}

impl PlainFetcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        manager: Arc<TaskManager>,
        events: Arc<dyn EventSink>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            http,
            manager,
            events,
            config,
        }
    }

    async fn persist_progress(&self, task_id: TaskId, downloaded: u64) {
        if let Err(e) = self.manager.set_progress(task_id, downloaded).await {
            warn!("Failed to persist progress for {}: {}", task_id, e);
        }
    }

    async fn persist_total(&self, task_id: TaskId, total: u64) {
        if let Err(e) = self.manager.set_total_size(task_id, total).await {
            warn!("Failed to persist size for {}: {}", task_id, e);
        }
    }

    fn publish_progress(&self, task_id: TaskId, downloaded: u64, total: u64, speed: f64) {
        self.events.publish(DownloadEvent::TaskProgress {
            task_id,
            bytes_done: downloaded,
            bytes_total: total,
            speed,
            eta_seconds: eta_seconds(downloaded, total, speed),
        });
    }

    async fn send_request(
        &self,
        task: &DownloadTask,
        existing: u64,
        control: &TaskControl,
    ) -> Result<Option<HttpResponse>, DownloadError> {
        let mut headers = vec![("User-Agent".to_string(), self.config.user_agent.clone())];
        if existing > 0 {
            headers.push(("Range".to_string(), range_from(existing)));
            info!("断点续传: {} 从字节 {} 开始", task.file_name, existing);
        }

        tokio::select! {
            biased;
            _ = control.interrupted() => Ok(None),
            response = self.http.get(&task.url, &headers) => response.map(Some),
        }
    }
}

#[async_trait]
impl Fetcher for PlainFetcher {
    async fn run(
        &self,
        task: DownloadTask,
        control: Arc<TaskControl>,
    ) -> Result<FetchOutcome, DownloadError> {
        let full_path = Path::new(&task.file_path);

        // 创建输出目录
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 检查现有文件大小以支持断点续传
        let existing = match tokio::fs::metadata(full_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };

        let Some(response) = self.send_request(&task, existing, &control).await? else {
            return Ok(control.stop_outcome().unwrap_or(FetchOutcome::Paused));
        };

        let (mut downloaded, mut total) = match response.status {
            206 => {
                let content_range = response.header("content-range");
                let start = content_range
                    .and_then(parse_content_range_start)
                    .unwrap_or(existing);
                let total = content_range
                    .and_then(parse_content_range_total)
                    .or_else(|| response.content_length.map(|len| start + len))
                    .unwrap_or(0);

                match start {
                    s if s == existing => (existing, total),
                    0 => {
                        warn!("服务器忽略了续传位置，从头下载: {}", task.file_name);
                        (0, total)
                    }
                    s => {
                        tokio::fs::remove_file(full_path).await?;
                        return Err(errors::network_error(
                            format!("续传位置不匹配: 请求 {}，返回 {}", existing, s),
                            Some(206),
                            true,
                        ));
                    }
                }
            }
            200 => {
                if existing > 0 {
                    info!("服务器不支持断点续传，从头下载: {}", task.file_name);
                }
                (0, response.content_length.unwrap_or(0))
            }
            416 if existing > 0 => {
                // 本地文件已完整
                if task.total_size == 0 || task.total_size == existing {
                    info!("文件已完整: {} ({} 字节)", task.file_name, existing);
                    self.persist_total(task.id, existing).await;
                    self.persist_progress(task.id, existing).await;
                    self.publish_progress(task.id, existing, existing, 0.0);
                    return Ok(FetchOutcome::Completed);
                }
                tokio::fs::remove_file(full_path).await?;
                return Err(errors::network_error(
                    format!("续传位置 {} 无效，已删除本地文件", existing),
                    Some(416),
                    true,
                ));
            }
            status => return Err(errors::http_status_error(&task.url, status)),
        };

        // 打开文件准备写入
        let mut file = if downloaded == 0 {
            File::create(full_path).await?
        } else {
            let mut file = OpenOptions::new().write(true).open(full_path).await?;
            file.seek(SeekFrom::Start(downloaded)).await?;
            file
        };

        self.persist_progress(task.id, downloaded).await;
        self.persist_total(task.id, total).await;

        let read_timeout = self.config.timeout();
        let mut throttle = ProgressThrottle::new(self.config.progress_interval(), downloaded);
        let mut body = response.body;

        loop {
            let next = tokio::select! {
                biased;
                _ = control.interrupted() => None,
                next = tokio::time::timeout(read_timeout, body.next()) => Some(next),
            };

            let chunk = match next {
                None => {
                    file.flush().await?;
                    return Ok(match control.stop_outcome() {
                        Some(FetchOutcome::Cancelled) => FetchOutcome::Cancelled,
                        _ => {
                            self.persist_progress(task.id, downloaded).await;
                            info!("⏸️ 已暂停: {} 于 {} 字节", task.file_name, downloaded);
                            FetchOutcome::Paused
                        }
                    });
                }
                Some(Err(_)) => {
                    file.flush().await?;
                    self.persist_progress(task.id, downloaded).await;
                    return Err(errors::network_error(
                        format!("读取超时 ({:?})", read_timeout),
                        None,
                        true,
                    ));
                }
                Some(Ok(None)) => break,
                Some(Ok(Some(chunk))) => chunk,
            };

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    self.persist_progress(task.id, downloaded).await;
                    return Err(e);
                }
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if total > 0 && downloaded > total {
                total = downloaded;
            }

            // 更新进度（限制更新频率）
            if let Some(sample) = throttle.poll(downloaded, Instant::now()) {
                self.publish_progress(task.id, downloaded, total, sample.speed);
                self.persist_progress(task.id, downloaded).await;
            }
        }

        // 确保文件数据写入磁盘
        file.flush().await?;
        file.sync_all().await?;

        if total > downloaded {
            self.persist_progress(task.id, downloaded).await;
            return Err(errors::network_error(
                format!("连接提前关闭: {}/{} 字节", downloaded, total),
                None,
                true,
            ));
        }

        if total == 0 {
            total = downloaded;
            self.persist_total(task.id, total).await;
        }
        self.persist_progress(task.id, downloaded).await;

        // 最后一次进度更新
        let sample = throttle.flush(downloaded, Instant::now());
        self.publish_progress(task.id, downloaded, total, sample.speed);

        debug!("文件下载完成: {} ({} 字节)", task.file_name, downloaded);
        Ok(FetchOutcome::Completed)
    }
}

