//! Scripted [`HttpClient`] and engine builders shared by the test modules

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::EngineConfig;
use crate::core::engine::DownloadEngine;
use crate::core::error_handling::{errors, DownloadError};
use crate::core::events::{DownloadEvent, EventReceiver};
use crate::core::http::{HttpClient, HttpResponse};
use crate::core::repository::InMemoryTaskRepository;

/// Canned response for one URL
#[derive(Debug, Clone)]
pub struct MockRoute {
    pub body: Bytes,
    pub status: u16,
    pub content_type: Option<String>,
    pub supports_range: bool,
    /// Requests that fail with a retryable network error before the route answers
    pub fail_times: u32,
    pub always_fail: bool,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Answer every ranged request with a 206 starting at byte 0
    pub restart_on_range: bool,
    /// Count open bodies of this route in the client's in-flight gauge
    pub tracked: bool,
}

impl MockRoute {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            content_type: None,
            supports_range: true,
            fail_times: 0,
            always_fail: false,
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
            restart_on_range: false,
            tracked: false,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn without_range(mut self) -> Self {
        self.supports_range = false;
        self
    }

    pub fn fail_times(mut self, times: u32) -> Self {
        self.fail_times = times;
        self
    }

    pub fn always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn restart_on_range(mut self) -> Self {
        self.restart_on_range = true;
        self
    }

    pub fn tracked(mut self) -> Self {
        self.tracked = true;
        self
    }

    pub fn chunked(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
pub struct MockHttpClient {
    routes: RwLock<HashMap<String, MockRoute>>,
    requests: Mutex<Vec<RecordedRequest>>,
    reachable: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// Holds one slot of the in-flight gauge until the body is finished or dropped
#[derive(Debug)]
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, body: impl Into<Bytes>) {
        self.add_route(url, MockRoute::new(body));
    }

    pub fn add_route(&self, url: &str, route: MockRoute) {
        self.routes.write().insert(url.to_string(), route);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }

    /// Highest number of tracked bodies open at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter_flight(&self) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(&self.in_flight))
    }

    /// Decide the outcome of one request while holding the route table
    fn answer(&self, url: &str) -> Result<Option<MockRoute>, DownloadError> {
        let mut routes = self.routes.write();
        let Some(route) = routes.get_mut(url) else {
            return Ok(None);
        };

        if route.always_fail {
            return Err(errors::network_error("mock connection reset", None, true));
        }
        if route.fail_times > 0 {
            route.fail_times -= 1;
            return Err(errors::network_error("mock connection reset", None, true));
        }
        Ok(Some(route.clone()))
    }
}

fn requested_offset(headers: &[(String, String)]) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| value.strip_prefix("bytes="))
        .and_then(|range| range.trim_end_matches('-').parse().ok())
}

fn chunked_body(
    body: Bytes,
    chunk_size: usize,
    delay: Duration,
    guard: Option<InFlightGuard>,
) -> crate::core::http::ByteStream {
    stream::unfold((0usize, guard), move |(offset, guard)| {
        let body = body.clone();
        async move {
            if offset >= body.len() {
                return None;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let end = (offset + chunk_size).min(body.len());
            Some((Ok(body.slice(offset..end)), (end, guard)))
        }
    })
    .boxed()
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, DownloadError> {
        self.requests.lock().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.to_vec(),
        });

        let Some(route) = self.answer(url)? else {
            return Ok(HttpResponse::from_bytes(404, Bytes::new()));
        };
        if route.status != 200 {
            return Ok(HttpResponse::from_bytes(route.status, Bytes::new()));
        }

        let total = route.body.len() as u64;
        let (status, body, content_range) = match requested_offset(headers) {
            Some(_) if route.restart_on_range && total > 0 => (
                206,
                route.body.clone(),
                Some(format!("bytes 0-{}/{}", total - 1, total)),
            ),
            Some(offset) if route.supports_range && offset >= total => {
                return Ok(HttpResponse::from_bytes(416, Bytes::new()));
            }
            Some(offset) if route.supports_range => (
                206,
                route.body.slice(offset as usize..),
                Some(format!("bytes {}-{}/{}", offset, total - 1, total)),
            ),
            _ => (200, route.body.clone(), None),
        };

        let mut response_headers = HashMap::new();
        if let Some(content_range) = content_range {
            response_headers.insert("content-range".to_string(), content_range);
        }
        if let Some(content_type) = &route.content_type {
            response_headers.insert("content-type".to_string(), content_type.clone());
        }

        let guard = route.tracked.then(|| self.enter_flight());
        Ok(HttpResponse {
            status,
            headers: response_headers,
            content_length: Some(body.len() as u64),
            body: chunked_body(body, route.chunk_size, route.chunk_delay, guard),
        })
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Fast timings so retry and progress paths finish within a test
pub fn test_config(download_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        download_dir: download_dir.to_string_lossy().into_owned(),
        task_retry_base_delay_ms: 10,
        fetch_retry_base_delay_ms: 5,
        progress_interval_ms: 20,
        timeout_seconds: 5,
        ..EngineConfig::default()
    }
}

pub fn test_engine(config: EngineConfig, http: Arc<MockHttpClient>) -> DownloadEngine {
    DownloadEngine::new(config, Arc::new(InMemoryTaskRepository::new()), http)
}

/// Wait for the first event matching `predicate`, with a generous timeout
pub async fn wait_for_event<F>(rx: &mut EventReceiver, mut predicate: F) -> Option<DownloadEvent>
where
    F: FnMut(&DownloadEvent) -> bool,
{
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        while let Some(event) = rx.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Drain everything already queued without waiting
pub fn drain_events(rx: &mut EventReceiver) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
