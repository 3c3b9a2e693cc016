//! M3U8下载器集成测试
//!
//! 测试HLS流媒体下载的完整工作流程，包括：
//! - 分片乱序完成后按序合并
//! - 主播放列表选择第一个变体流
//! - AES-128 解密与密钥缓存
//! - 暂停恢复时跳过已暂存的分片
//! - 分片重试耗尽后任务失败

#[cfg(test)]
mod tests {
    use super::super::config::EngineConfig;
    use super::super::events::DownloadEvent;
    use super::super::m3u8_downloader::{derive_iv, segment_file_name};
    use super::super::manager::TaskManager;
    use super::super::models::*;
    use super::super::test_support::*;
    use aes::Aes128;
    use cbc::Encryptor;
    use cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    const BASE: &str = "https://cdn.test/hls";
    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn segment_body(index: usize) -> Vec<u8> {
        format!("segment-{:03}|", index).repeat(40).into_bytes()
    }

    fn media_playlist(count: usize) -> String {
        let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
        for i in 0..count {
            text.push_str(&format!("#EXTINF:4.0,\nseg{}.ts\n", i));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    fn encrypt(plain: &[u8], iv: &[u8; 16]) -> Vec<u8> {
        Encryptor::<Aes128>::new_from_slices(&KEY, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    fn expected_output(count: usize) -> Vec<u8> {
        (0..count).flat_map(segment_body).collect()
    }

    fn is_completed(id: TaskId) -> impl FnMut(&DownloadEvent) -> bool {
        move |e: &DownloadEvent| matches!(e, DownloadEvent::TaskCompleted { task_id, .. } if *task_id == id)
    }

    fn is_failed(id: TaskId) -> impl FnMut(&DownloadEvent) -> bool {
        move |e: &DownloadEvent| matches!(e, DownloadEvent::TaskFailed { task_id, .. } if *task_id == id)
    }

    fn staged_indices(task: &DownloadTask, count: usize) -> Vec<usize> {
        let staging = TaskManager::staging_dir(task);
        (0..count)
            .filter(|i| {
                std::fs::metadata(staging.join(segment_file_name(*i)))
                    .map(|m| m.len() > 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_segments_merge_in_index_order() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let count = 6;
        let manifest_url = format!("{}/index.m3u8", BASE);
        http.add(&manifest_url, media_playlist(count));
        for i in 0..count {
            // 序号越小越慢，完成顺序与序号相反
            let delay = Duration::from_millis(((count - i) * 15) as u64);
            http.add_route(
                &format!("{}/seg{}.ts", BASE, i),
                MockRoute::new(segment_body(i)).chunked(1 << 16, delay),
            );
        }

        let engine = test_engine(test_config(dir.path()), http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "剧集", "第1集").await?;
        assert!(wait_for_event(&mut events, is_completed(id)).await.is_some());

        let task = engine.get_task(id).await?;
        assert!(task.is_segmented);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.total_segments, count as u32);
        assert_eq!(task.downloaded_segments, count as u32);
        assert!(task.file_name.ends_with(".mp4"));

        let merged = tokio::fs::read(&task.file_path).await?;
        assert_eq!(merged, expected_output(count));
        assert_eq!(task.total_size, merged.len() as u64);
        assert!(!TaskManager::staging_dir(&task).exists(), "合并后应删除临时目录");
        Ok(())
    }

    #[tokio::test]
    async fn test_master_playlist_downloads_first_variant() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let master_url = format!("{}/master.m3u8", BASE);
        http.add(
            &master_url,
            "#EXTM3U\n\
             #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
             low/index.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1600000,RESOLUTION=1280x720\n\
             high/index.m3u8\n",
        );
        http.add(&format!("{}/low/index.m3u8", BASE), media_playlist(3));
        for i in 0..3 {
            http.add(&format!("{}/low/seg{}.ts", BASE, i), segment_body(i));
        }

        let engine = test_engine(test_config(dir.path()), http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&master_url, "Show", "E01").await?;
        assert!(wait_for_event(&mut events, is_completed(id)).await.is_some());

        let task = engine.get_task(id).await?;
        assert_eq!(task.total_segments, 3);
        assert_eq!(
            task.manifest_url.as_deref(),
            Some("https://cdn.test/hls/low/index.m3u8")
        );
        assert_eq!(tokio::fs::read(&task.file_path).await?, expected_output(3));

        let touched_high = http
            .requests()
            .iter()
            .any(|r| r.url.contains("/high/"));
        assert!(!touched_high, "只应下载第一个变体流");
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_segments_are_decrypted() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let manifest_url = format!("{}/enc/index.m3u8", BASE);
        let key_url = format!("{}/enc/key.bin", BASE);
        let explicit_iv = "0x0000000000000000000000000000000A";

        http.add(
            &manifest_url,
            format!(
                "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
                 #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
                 #EXTINF:4.0,\nseg0.ts\n\
                 #EXTINF:4.0,\nseg1.ts\n\
                 #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV={}\n\
                 #EXTINF:4.0,\nseg2.ts\n\
                 #EXT-X-ENDLIST\n",
                explicit_iv
            ),
        );
        http.add(&key_url, KEY.to_vec());
        for i in 0..2 {
            let iv = derive_iv(None, i).unwrap();
            http.add(&format!("{}/enc/seg{}.ts", BASE, i), encrypt(&segment_body(i), &iv));
        }
        let iv = derive_iv(Some(explicit_iv), 2).unwrap();
        http.add(&format!("{}/enc/seg2.ts", BASE), encrypt(&segment_body(2), &iv));

        let engine = test_engine(test_config(dir.path()), http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "enc", "1").await?;
        assert!(wait_for_event(&mut events, is_completed(id)).await.is_some());

        let task = engine.get_task(id).await?;
        assert_eq!(tokio::fs::read(&task.file_path).await?, expected_output(3));
        assert_eq!(http.request_count(&key_url), 1, "密钥只应获取一次");
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_key_fails_in_strict_mode() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let manifest_url = format!("{}/bad/index.m3u8", BASE);
        http.add(
            &manifest_url,
            "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
        );
        http.add(&format!("{}/bad/key.bin", BASE), vec![1u8; 8]);
        http.add(&format!("{}/bad/seg0.ts", BASE), segment_body(0));

        let engine = test_engine(test_config(dir.path()), http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "bad", "key").await?;
        match wait_for_event(&mut events, is_failed(id)).await {
            Some(DownloadEvent::TaskFailed { error, .. }) => assert!(error.contains("Decryption")),
            other => panic!("expected failure event, got {:?}", other),
        }

        // 解密错误不可重试
        assert_eq!(http.request_count(&format!("{}/bad/seg0.ts", BASE)), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lenient_mode_keeps_undecryptable_bytes() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let manifest_url = format!("{}/lenient/index.m3u8", BASE);
        http.add(
            &manifest_url,
            "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
        );
        http.add(&format!("{}/lenient/key.bin", BASE), vec![1u8; 8]);
        http.add(&format!("{}/lenient/seg0.ts", BASE), segment_body(0));

        let config = EngineConfig {
            strict_decryption: false,
            ..test_config(dir.path())
        };
        let engine = test_engine(config, http);
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "lenient", "key").await?;
        assert!(wait_for_event(&mut events, is_completed(id)).await.is_some());

        let task = engine.get_task(id).await?;
        assert_eq!(tokio::fs::read(&task.file_path).await?, segment_body(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_resume_skips_staged_segments() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let count = 10;
        let manifest_url = format!("{}/long/index.m3u8", BASE);
        http.add(&manifest_url, media_playlist(count));
        for i in 0..count {
            http.add_route(
                &format!("{}/long/seg{}.ts", BASE, i),
                MockRoute::new(segment_body(i)).chunked(1 << 16, Duration::from_millis(60)),
            );
        }

        let engine = test_engine(test_config(dir.path()), http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "long", "1").await?;
        let progressed = wait_for_event(&mut events, |e| {
            matches!(e, DownloadEvent::SegmentProgress { task_id, segments_done, .. }
                if *task_id == id && *segments_done >= 3)
        })
        .await;
        assert!(progressed.is_some());

        engine.pause(id).await?;
        let paused = engine.get_task(id).await?;
        assert_eq!(paused.status, TaskStatus::Paused);
        let done_before = paused.downloaded_segments;
        let staged = staged_indices(&paused, count);
        assert!(done_before >= 3 && (done_before as usize) < count);
        assert_eq!(staged.len(), done_before as usize);

        drain_events(&mut events);
        engine.resume(id).await?;

        let mut progress_after = Vec::new();
        while let Some(event) = wait_for_event(&mut events, |_| true).await {
            match event {
                DownloadEvent::SegmentProgress {
                    task_id,
                    segments_done,
                    ..
                } if task_id == id => progress_after.push(segments_done),
                DownloadEvent::TaskCompleted { task_id, .. } if task_id == id => break,
                _ => {}
            }
        }

        assert!(!progress_after.is_empty());
        assert!(progress_after[0] >= done_before);
        assert!(progress_after.windows(2).all(|w| w[0] <= w[1]));

        // 已暂存的分片不会再次请求
        for i in staged {
            assert_eq!(http.request_count(&format!("{}/long/seg{}.ts", BASE, i)), 1);
        }

        let task = engine.get_task(id).await?;
        assert_eq!(task.downloaded_segments, count as u32);
        assert_eq!(tokio::fs::read(&task.file_path).await?, expected_output(count));
        Ok(())
    }

    #[tokio::test]
    async fn test_segment_budget_exhaustion_fails_task() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let manifest_url = format!("{}/broken/index.m3u8", BASE);
        let broken_url = format!("{}/broken/seg1.ts", BASE);
        http.add(&manifest_url, media_playlist(3));
        http.add(&format!("{}/broken/seg0.ts", BASE), segment_body(0));
        http.add_route(&broken_url, MockRoute::new(Vec::new()).always_fail());
        http.add(&format!("{}/broken/seg2.ts", BASE), segment_body(2));

        let config = EngineConfig {
            task_retry_attempts: 0,
            segment_retry_budget: 2,
            fetch_retry_attempts: 1,
            ..test_config(dir.path())
        };
        let engine = test_engine(config, http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "broken", "1").await?;
        match wait_for_event(&mut events, is_failed(id)).await {
            Some(DownloadEvent::TaskFailed { error, .. }) => assert!(error.contains("分片 1")),
            other => panic!("expected failure event, got {:?}", other),
        }

        let task = engine.get_task(id).await?;
        assert_eq!(task.status, TaskStatus::Failed);
        // 首次尝试加上两次重新排队
        assert_eq!(http.request_count(&broken_url), 3);
        assert!(!std::path::Path::new(&task.file_path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_encryption_fails_fast() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let manifest_url = format!("{}/sample/index.m3u8", BASE);
        http.add(
            &manifest_url,
            "#EXTM3U\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"key.bin\"\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
        );

        let engine = test_engine(test_config(dir.path()), http.clone());
        let mut events = engine.subscribe();

        let id = engine.add_task(&manifest_url, "sample", "aes").await?;
        match wait_for_event(&mut events, is_failed(id)).await {
            Some(DownloadEvent::TaskFailed { error, .. }) => assert!(error.contains("SAMPLE-AES")),
            other => panic!("expected failure event, got {:?}", other),
        }
        assert_eq!(http.request_count(&format!("{}/sample/seg0.ts", BASE)), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_segment_pool_is_shared_between_tasks() -> AppResult<()> {
        let dir = tempdir()?;
        let http = Arc::new(MockHttpClient::new());
        let count = 8;
        for show in ["a", "b"] {
            http.add(&format!("{}/{}/index.m3u8", BASE, show), media_playlist(count));
            for i in 0..count {
                http.add_route(
                    &format!("{}/{}/seg{}.ts", BASE, show, i),
                    MockRoute::new(segment_body(i))
                        .chunked(200, Duration::from_millis(15))
                        .tracked(),
                );
            }
        }

        let config = EngineConfig {
            max_concurrent_tasks: 2,
            segment_workers: 3,
            ..test_config(dir.path())
        };
        let engine = test_engine(config, http.clone());
        let mut events = engine.subscribe();

        let a = engine.add_task(&format!("{}/a/index.m3u8", BASE), "并发", "a").await?;
        let b = engine.add_task(&format!("{}/b/index.m3u8", BASE), "并发", "b").await?;

        let mut pending = vec![a, b];
        while !pending.is_empty() {
            let Some(event) = wait_for_event(&mut events, |e| e.is_terminal()).await else {
                panic!("tasks did not finish");
            };
            assert!(matches!(event, DownloadEvent::TaskCompleted { .. }), "{:?}", event);
            pending.retain(|id| *id != event.task_id());
        }

        // 两个任务合计也不超过全局分片并发
        let peak = http.peak_in_flight();
        assert!(peak <= 3, "peak in-flight segments {}", peak);
        assert!(peak >= 2);

        for id in [a, b] {
            let task = engine.get_task(id).await?;
            assert_eq!(tokio::fs::read(&task.file_path).await?, expected_output(count));
        }
        Ok(())
    }
}
