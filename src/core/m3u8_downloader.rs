//! M3U8/HLS 流媒体下载器
//!
//! 每次运行的流程：
//! - 解析缓存或重新拉取的播放列表，主播放列表只取第一个变体流
//! - 预取一次 AES-128 密钥，按密钥地址缓存
//! - 跳过暂存目录中已存在的非空分片
//! - 所有 HLS 任务共享同一个分片工作池，失败的分片重新排队
//! - 独立的进度上报任务按固定间隔输出平滑后的速度
//! - 全部分片就绪后按序号合并为单个文件

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::Decryptor;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::control::{FetchOutcome, Fetcher, TaskControl};
use crate::core::error_handling::{errors, DownloadError, RetryExecutor};
use crate::core::events::{DownloadEvent, EventSink};
use crate::core::http::{self, HttpClient};
use crate::core::manager::TaskManager;
use crate::core::models::{DownloadTask, TaskId};
use crate::core::progress_tracker::{ProgressThrottle, SpeedSampler};
use crate::parsers::m3u8_parser::{self, EncryptionInfo, Manifest, Segment};

const INIT_SEGMENT_FILE: &str = "init.seg";

/// Staged file name of segment `index`
pub fn segment_file_name(index: usize) -> String {
    format!("{:05}.ts", index)
}

/// A concrete media playlist together with the text and URL it came from
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub url: String,
    pub text: String,
    pub manifest: Manifest,
}

impl ResolvedManifest {
    pub fn segment_count(&self) -> u32 {
        self.manifest.segments.len() as u32
    }
}

/// Fetch `url` and resolve it to a media playlist
pub async fn resolve_media_manifest<A>(
    client: &dyn HttpClient,
    url: &str,
    user_agent: &str,
    read_timeout: Duration,
    retry: &RetryExecutor,
    abort: A,
) -> Result<ResolvedManifest, DownloadError>
where
    A: Fn() -> bool,
{
    let text = retry
        .execute_with_abort(&abort, |_| {
            http::fetch_text(client, url, user_agent, read_timeout)
        })
        .await?;
    resolve_manifest_text(client, url, text, user_agent, read_timeout, retry, abort).await
}

/// Parse `text`; a master playlist is replaced by its first variant, one level deep
pub async fn resolve_manifest_text<A>(
    client: &dyn HttpClient,
    source_url: &str,
    text: String,
    user_agent: &str,
    read_timeout: Duration,
    retry: &RetryExecutor,
    abort: A,
) -> Result<ResolvedManifest, DownloadError>
where
    A: Fn() -> bool,
{
    let manifest = m3u8_parser::parse(&text, source_url)?;
    if !manifest.is_master {
        return Ok(ResolvedManifest {
            url: source_url.to_string(),
            text,
            manifest,
        });
    }

    let variant_url = manifest
        .first_variant()
        .ok_or_else(|| errors::format_error("主播放列表没有可用的变体流"))?
        .to_string();
    info!("选择第一个变体流: {}", variant_url);

    let variant_text = retry
        .execute_with_abort(&abort, |_| {
            http::fetch_text(client, &variant_url, user_agent, read_timeout)
        })
        .await?;
    let variant = m3u8_parser::parse(&variant_text, &variant_url)?;
    if variant.is_master {
        return Err(errors::format_error(format!(
            "变体流仍是主播放列表: {}",
            variant_url
        )));
    }

    Ok(ResolvedManifest {
        url: variant_url,
        text: variant_text,
        manifest: variant,
    })
}

/// Only `AES-128` with a key URI can be decrypted
fn check_encryption(manifest: &Manifest) -> Result<(), DownloadError> {
    let descriptors = manifest
        .encryption
        .iter()
        .chain(manifest.segments.iter().filter_map(|s| s.encryption.as_ref()));

    for encryption in descriptors {
        if !encryption.is_encrypted() {
            continue;
        }
        if !encryption.is_aes128() {
            return Err(errors::format_error(format!(
                "不支持的加密方式: {}",
                encryption.method
            )));
        }
        if encryption.key_url.is_none() {
            return Err(errors::format_error("AES-128 加密缺少密钥地址"));
        }
    }
    Ok(())
}

/// 解密单个 TS 片段
pub fn decrypt_segment(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>, DownloadError> {
    if key.len() != 16 {
        return Err(errors::decryption_error(format!(
            "AES-128 密钥长度必须为 16 字节，当前为 {}",
            key.len()
        )));
    }

    let decryptor = Decryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|e| errors::decryption_error(e.to_string()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| errors::decryption_error("AES-128 解密失败"))
}

/// 计算 AES-128 IV：显式 IV 优先，否则序号大端写入末 4 字节
pub fn derive_iv(iv: Option<&str>, segment_index: usize) -> Result<[u8; 16], DownloadError> {
    match iv {
        Some(raw) => {
            parse_iv(raw).ok_or_else(|| errors::format_error(format!("IV 格式无效: {}", raw)))
        }
        None => {
            let mut iv = [0u8; 16];
            iv[12..].copy_from_slice(&(segment_index as u32).to_be_bytes());
            Ok(iv)
        }
    }
}

fn parse_iv(raw: &str) -> Option<[u8; 16]> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 32 {
        return None;
    }

    let decoded = hex::decode(format!("{:0>32}", digits)).ok()?;
    <[u8; 16]>::try_from(decoded).ok()
}

/// Bounded segment concurrency shared by every running HLS task
#[derive(Debug, Clone)]
pub struct SegmentPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl SegmentPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }
}

/// State of one run, shared by its workers and its progress reporter
struct SegmentRun {
    task_id: TaskId,
    segments: Vec<Segment>,
    staging: PathBuf,
    control: Arc<TaskControl>,
    pending: Mutex<VecDeque<usize>>,
    retry_counts: DashMap<usize, u32>,
    completed: AtomicU32,
    bytes: AtomicU64,
    hard_error: Mutex<Option<DownloadError>>,
    keys: DashMap<String, Bytes>,
}

impl SegmentRun {
    fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn record(&self, len: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(len, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.control.is_interrupted() || self.hard_error.lock().is_some()
    }

    /// First hard error wins
    fn fail(&self, error: DownloadError) {
        let mut slot = self.hard_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take_error(&self) -> Option<DownloadError> {
        self.hard_error.lock().take()
    }

    fn next_index(&self) -> Option<usize> {
        self.pending.lock().pop_front()
    }

    fn requeue(&self, index: usize) {
        self.pending.lock().push_back(index);
    }

    fn segment_path(&self, index: usize) -> PathBuf {
        self.staging.join(segment_file_name(index))
    }
}

/// HLS fetcher; one instance serves every segmented task
pub struct SegmentedFetcher {
    http: Arc<dyn HttpClient>,
    manager: Arc<TaskManager>,
    events: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    pool: SegmentPool,
}

impl SegmentedFetcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        manager: Arc<TaskManager>,
        events: Arc<dyn EventSink>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let pool = SegmentPool::new(config.segment_workers);
        Self {
            http,
            manager,
            events,
            config,
            pool,
        }
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    async fn load_manifest(
        &self,
        task: &DownloadTask,
        retry: &RetryExecutor,
        control: &TaskControl,
    ) -> Result<ResolvedManifest, DownloadError> {
        let abort = || control.is_interrupted();
        match task.manifest_content.as_ref().filter(|t| !t.trim().is_empty()) {
            Some(text) => {
                let source_url = task.manifest_url.as_deref().unwrap_or(&task.url);
                resolve_manifest_text(
                    self.http.as_ref(),
                    source_url,
                    text.clone(),
                    &self.config.user_agent,
                    self.config.timeout(),
                    retry,
                    abort,
                )
                .await
            }
            None => {
                resolve_media_manifest(
                    self.http.as_ref(),
                    &task.url,
                    &self.config.user_agent,
                    self.config.timeout(),
                    retry,
                    abort,
                )
                .await
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        retry: &RetryExecutor,
        control: &TaskControl,
    ) -> Result<Bytes, DownloadError> {
        let client = self.http.as_ref();
        let user_agent = self.config.user_agent.as_str();
        let read_timeout = self.config.timeout();

        tokio::select! {
            biased;
            _ = control.interrupted() => Err(errors::network_error("下载被中断", None, true)),
            result = retry.execute_with_abort(
                || control.is_interrupted(),
                |_| http::fetch_bytes(client, url, user_agent, read_timeout),
            ) => result,
        }
    }

    /// Key bytes for `encryption`, fetched once per key URL per run
    async fn key_for(
        &self,
        run: &SegmentRun,
        encryption: &EncryptionInfo,
        retry: &RetryExecutor,
    ) -> Result<Bytes, DownloadError> {
        let key_url = encryption
            .key_url
            .as_deref()
            .ok_or_else(|| errors::format_error("AES-128 加密缺少密钥地址"))?;

        if let Some(key) = run.keys.get(key_url).map(|entry| entry.value().clone()) {
            return Ok(key);
        }

        debug!("获取解密密钥: {}", key_url);
        let key = self.fetch_with_retry(key_url, retry, &run.control).await?;
        run.keys.insert(key_url.to_string(), key.clone());
        Ok(key)
    }

    fn decrypt_or_keep(
        &self,
        data: Bytes,
        key: &[u8],
        encryption: &EncryptionInfo,
        index: usize,
    ) -> Result<Vec<u8>, DownloadError> {
        let iv = derive_iv(encryption.iv.as_deref(), index)?;
        match decrypt_segment(&data, key, &iv) {
            Ok(plain) => Ok(plain),
            Err(e) if self.config.strict_decryption => Err(e),
            Err(e) => {
                warn!("分片 {} 解密失败，按明文保存: {}", index, e);
                Ok(data.to_vec())
            }
        }
    }

    /// Download, decrypt and stage one segment; returns the staged size
    async fn fetch_segment(
        &self,
        run: &SegmentRun,
        index: usize,
        retry: &RetryExecutor,
    ) -> Result<u64, DownloadError> {
        let segment = &run.segments[index];
        let data = self.fetch_with_retry(&segment.url, retry, &run.control).await?;
        if data.is_empty() {
            return Err(errors::network_error(
                format!("分片 {} 内容为空: {}", index, segment.url),
                None,
                true,
            ));
        }

        let data = match segment.encryption.as_ref().filter(|e| e.is_encrypted()) {
            Some(encryption) => {
                let key = self.key_for(run, encryption, retry).await?;
                self.decrypt_or_keep(data, &key, encryption, index)?
            }
            None => data.to_vec(),
        };

        stage_file(&run.segment_path(index), &data).await?;
        Ok(data.len() as u64)
    }

    fn handle_segment_failure(&self, run: &SegmentRun, index: usize, error: DownloadError) {
        if !error.is_retryable() {
            error!("片段 #{} 无法恢复: {}", index, error);
            run.fail(error);
            return;
        }

        let attempts = {
            let mut count = run.retry_counts.entry(index).or_insert(0);
            *count += 1;
            *count
        };

        let budget = self.config.segment_retry_budget;
        if attempts <= budget {
            warn!("片段 #{} 下载失败，第 {} 次重新排队: {}", index, attempts, error);
            run.requeue(index);
        } else {
            run.fail(errors::network_error(
                format!(
                    "分片 {} 下载失败，已重试 {} 次: {}",
                    index,
                    budget,
                    error.message()
                ),
                error.status(),
                true,
            ));
        }
    }

    async fn worker(&self, run: &SegmentRun, retry: &RetryExecutor) {
        while !run.should_stop() {
            let Some(index) = run.next_index() else {
                break;
            };

            let permit = tokio::select! {
                biased;
                _ = run.control.interrupted() => None,
                permit = self.pool.acquire() => permit,
            };
            let Some(_permit) = permit else {
                run.requeue(index);
                break;
            };
            if run.should_stop() {
                run.requeue(index);
                break;
            }

            match self.fetch_segment(run, index, retry).await {
                Ok(len) => {
                    run.record(len);
                    debug!(
                        "片段 {}/{} 下载完成 ({} bytes)",
                        run.completed(),
                        run.segments.len(),
                        len
                    );
                }
                Err(_) if run.control.is_interrupted() => {
                    run.requeue(index);
                    break;
                }
                Err(e) => self.handle_segment_failure(run, index, e),
            }
        }
    }

    async fn stage_init_segment(
        &self,
        run: &SegmentRun,
        url: &str,
        retry: &RetryExecutor,
    ) -> Result<(), DownloadError> {
        let path = run.staging.join(INIT_SEGMENT_FILE);
        if non_empty_len(&path).await.is_some() {
            return Ok(());
        }

        let data = self.fetch_with_retry(url, retry, &run.control).await?;
        stage_file(&path, &data).await?;
        debug!("初始化分片已暂存: {} bytes", data.len());
        Ok(())
    }

    async fn persist_segments(&self, task_id: TaskId, completed: u32) {
        if let Err(e) = self.manager.set_segment_progress(task_id, completed).await {
            warn!("Failed to persist segment progress for {}: {}", task_id, e);
        }
    }

    /// 合并片段为最终文件
    async fn merge_segments(
        &self,
        run: &SegmentRun,
        with_init: bool,
        output_path: &Path,
    ) -> Result<u64, DownloadError> {
        info!("合并 {} 个片段到: {:?}", run.segments.len(), output_path);

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut sources = Vec::with_capacity(run.segments.len() + 1);
        if with_init {
            sources.push(run.staging.join(INIT_SEGMENT_FILE));
        }
        sources.extend((0..run.segments.len()).map(|index| run.segment_path(index)));

        let mut output_file = File::create(output_path).await?;
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut written = 0u64;

        for source in &sources {
            let mut segment_file = File::open(source).await?;
            loop {
                let bytes_read = segment_file.read(&mut buffer).await?;
                if bytes_read == 0 {
                    break;
                }
                output_file.write_all(&buffer[..bytes_read]).await?;
                written += bytes_read as u64;
            }
        }

        output_file.flush().await?;
        output_file.sync_all().await?;

        info!("片段合并完成: {} bytes", written);
        Ok(written)
    }

    async fn finish(
        &self,
        task: &DownloadTask,
        run: &SegmentRun,
        with_init: bool,
    ) -> Result<FetchOutcome, DownloadError> {
        let completed = run.completed();

        if let Some(outcome) = run.control.stop_outcome() {
            if outcome == FetchOutcome::Paused {
                self.persist_segments(task.id, completed).await;
                info!("⏸️ HLS 任务 {} 已暂停于 {}/{}", task.id, completed, run.segments.len());
            }
            return Ok(outcome);
        }

        let hard_error = run.take_error();
        if let Some(error) = hard_error {
            self.persist_segments(task.id, completed).await;
            return Err(error);
        }

        let mut missing = 0usize;
        for index in 0..run.segments.len() {
            if non_empty_len(&run.segment_path(index)).await.is_none() {
                missing += 1;
            }
        }
        if missing > 0 {
            self.persist_segments(task.id, completed).await;
            return Err(errors::network_error(
                format!("下载未完成，缺少 {} 个分片", missing),
                None,
                true,
            ));
        }

        let total = run.segments.len() as u32;
        let merged = self
            .merge_segments(run, with_init, Path::new(&task.file_path))
            .await?;

        if let Err(e) = tokio::fs::remove_dir_all(&run.staging).await {
            warn!("清理临时目录失败 {:?}: {}", run.staging, e);
        }

        self.persist_segments(task.id, total).await;
        if let Err(e) = self.manager.set_total_size(task.id, merged).await {
            warn!("Failed to persist size for {}: {}", task.id, e);
        }
        if let Err(e) = self.manager.set_progress(task.id, merged).await {
            warn!("Failed to persist size for {}: {}", task.id, e);
        }

        self.events.publish(DownloadEvent::SegmentProgress {
            task_id: task.id,
            segments_done: total,
            segments_total: total,
            speed: 0.0,
        });
        Ok(FetchOutcome::Completed)
    }
}

#[async_trait]
impl Fetcher for SegmentedFetcher {
    async fn run(
        &self,
        task: DownloadTask,
        control: Arc<TaskControl>,
    ) -> Result<FetchOutcome, DownloadError> {
        let retry = RetryExecutor::new(self.config.fetch_retry_policy());

        let resolved = tokio::select! {
            biased;
            _ = control.interrupted() => {
                return Ok(control.stop_outcome().unwrap_or(FetchOutcome::Paused));
            }
            resolved = self.load_manifest(&task, &retry, &control) => resolved?,
        };

        let total = resolved.manifest.segments.len();
        if total == 0 {
            return Err(errors::format_error("M3U8没有分片"));
        }
        check_encryption(&resolved.manifest)?;

        // 更新总分片数
        if task.manifest_content.as_deref() != Some(resolved.text.as_str())
            || task.total_segments as usize != total
        {
            if let Err(e) = self
                .manager
                .set_manifest(task.id, &resolved.url, &resolved.text, total as u32)
                .await
            {
                warn!("Failed to cache manifest for {}: {}", task.id, e);
            }
        }

        let staging = TaskManager::staging_dir(&task);
        tokio::fs::create_dir_all(&staging).await?;

        let ResolvedManifest { manifest, .. } = resolved;
        let run = Arc::new(SegmentRun {
            task_id: task.id,
            segments: manifest.segments,
            staging,
            control: Arc::clone(&control),
            pending: Mutex::new(VecDeque::with_capacity(total)),
            retry_counts: DashMap::new(),
            completed: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            hard_error: Mutex::new(None),
            keys: DashMap::new(),
        });

        if let Some(encryption) = manifest.encryption.as_ref().filter(|e| e.is_encrypted()) {
            match self.key_for(&run, encryption, &retry).await {
                Ok(_) => {}
                Err(_) if control.is_interrupted() => return self.finish(&task, &run, false).await,
                Err(e) => return Err(e),
            }
        }

        let with_init = manifest.init_segment_url.is_some();
        if let Some(init_url) = manifest.init_segment_url.as_deref() {
            match self.stage_init_segment(&run, init_url, &retry).await {
                Ok(()) => {}
                Err(_) if control.is_interrupted() => return self.finish(&task, &run, with_init).await,
                Err(e) => return Err(e),
            }
        }

        // 初始化分片状态
        let mut skipped = 0usize;
        for index in 0..total {
            match non_empty_len(&run.segment_path(index)).await {
                Some(len) => {
                    run.record(len);
                    skipped += 1;
                }
                None => run.requeue(index),
            }
        }
        if skipped > 0 {
            info!("跳过已下载的 {} 个分片", skipped);
        }
        self.persist_segments(task.id, run.completed()).await;

        info!("开始下载 {} 个片段 (任务 {})", total - skipped, task.id);

        let stop = Arc::new(Notify::new());
        let reporter = tokio::spawn(report_progress(
            Arc::clone(&run),
            Arc::clone(&self.manager),
            Arc::clone(&self.events),
            self.config.progress_interval(),
            self.config.speed_sample_count,
            Arc::clone(&stop),
        ));

        join_all((0..self.pool.size()).map(|_| self.worker(&run, &retry))).await;

        stop.notify_one();
        if let Err(e) = reporter.await {
            warn!("Progress reporter for {} ended abnormally: {}", task.id, e);
        }

        self.finish(&task, &run, with_init).await
    }
}

/// Size of `path` if it exists and is non-empty
async fn non_empty_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

/// Write through a `.part` file so a visible staged file is always complete
async fn stage_file(path: &Path, data: &[u8]) -> Result<(), DownloadError> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    tokio::fs::write(&part, data).await?;
    tokio::fs::rename(&part, path).await?;
    Ok(())
}

async fn report_progress(
    run: Arc<SegmentRun>,
    manager: Arc<TaskManager>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    sample_count: usize,
    stop: Arc<Notify>,
) {
    let total = run.segments.len() as u32;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    let mut throttle = ProgressThrottle::new(interval, run.bytes());
    let mut sampler = SpeedSampler::new(sample_count);

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = ticker.tick() => {}
        }
        if run.control.is_interrupted() {
            break;
        }

        let sample = throttle.flush(run.bytes(), Instant::now());
        let speed = sampler.push(sample.speed);
        let done = run.completed();

        if let Err(e) = manager.set_segment_progress(run.task_id, done).await {
            warn!("Failed to persist segment progress for {}: {}", run.task_id, e);
        }
        events.publish(DownloadEvent::SegmentProgress {
            task_id: run.task_id,
            segments_done: done,
            segments_total: total,
            speed,
        });
    }
}
