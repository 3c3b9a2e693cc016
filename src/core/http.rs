//! HTTP capability consumed by the fetchers
//!
//! The engine never builds requests itself; it asks an injected [`HttpClient`] for a
//! GET with a handful of headers and reads back status, headers and a byte stream.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::core::error_handling::{errors, DownloadError};
use crate::utils::network;

/// A stream of body chunks with potential errors
pub type ByteStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// 预分配上限，Content-Length 只作参考
const MAX_PREALLOC: u64 = 1 << 20;

fn capacity_hint(content_length: Option<u64>) -> usize {
    content_length.map_or(0, |len| len.min(MAX_PREALLOC) as usize)
}

pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Response with an in-memory body, delivered as a single chunk
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let len = body.len() as u64;
        Self {
            status,
            headers: HashMap::new(),
            content_length: Some(len),
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Drain the body into memory
    pub async fn bytes(mut self) -> Result<Bytes, DownloadError> {
        let mut buffer = BytesMut::with_capacity(capacity_hint(self.content_length));
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Like [`bytes`](Self::bytes), failing with a retryable error if any single read stalls
    pub async fn bytes_with_timeout(mut self, read_timeout: Duration) -> Result<Bytes, DownloadError> {
        let mut buffer = BytesMut::with_capacity(capacity_hint(self.content_length));
        loop {
            match tokio::time::timeout(read_timeout, self.body.next()).await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk?),
                Ok(None) => break,
                Err(_) => {
                    return Err(errors::network_error(
                        format!("read stalled for {:?}", read_timeout),
                        None,
                        true,
                    ))
                }
            }
        }
        Ok(buffer.freeze())
    }

    pub async fn text(self) -> Result<String, DownloadError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Generic GET capability
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, DownloadError>;

    /// Whether the network looks usable; consulted before a failed task is retried
    async fn is_reachable(&self) -> bool {
        true
    }
}

/// GET `url` and return the whole body, failing on any non-2xx status
pub async fn fetch_bytes(
    client: &dyn HttpClient,
    url: &str,
    user_agent: &str,
    read_timeout: Duration,
) -> Result<Bytes, DownloadError> {
    let headers = vec![("User-Agent".to_string(), user_agent.to_string())];
    let response = client.get(url, &headers).await?;
    if !response.is_success() {
        return Err(errors::http_status_error(url, response.status));
    }
    response.bytes_with_timeout(read_timeout).await
}

pub async fn fetch_text(
    client: &dyn HttpClient,
    url: &str,
    user_agent: &str,
    read_timeout: Duration,
) -> Result<String, DownloadError> {
    let bytes = fetch_bytes(client, url, user_agent, read_timeout).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// [`HttpClient`] backed by reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
    probe_url: Option<String>,
}

impl ReqwestClient {
    /// `connect_timeout` bounds connection setup only; body reads are bounded by the fetchers
    pub fn new(
        connect_timeout: Duration,
        user_agent: &str,
        probe_url: Option<String>,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client, probe_url })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, DownloadError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DownloadError::from))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            content_length,
            body,
        })
    }

    async fn is_reachable(&self) -> bool {
        match &self.probe_url {
            Some(url) => network::check_connectivity(&self.client, url).await,
            None => true,
        }
    }
}
