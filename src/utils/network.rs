//! Network utilities and helpers

use std::time::Duration;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// User agent sent with every request unless configured otherwise
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Check network connectivity; any HTTP answer counts as reachable
pub async fn check_connectivity(client: &reqwest::Client, url: &str) -> bool {
    match client.head(url).timeout(DEFAULT_TIMEOUT).send().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Connectivity probe to {} failed: {}", url, e);
            false
        }
    }
}

/// `bytes=N-` header value for resuming at offset `start`
pub fn range_from(start: u64) -> String {
    format!("bytes={}-", start)
}

/// Complete length from a `Content-Range: bytes a-b/total` header, if stated
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

/// First byte position from a `Content-Range: bytes a-b/total` header
pub fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header() {
        assert_eq!(range_from(1024), "bytes=1024-");
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 100-199/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_content_range_start() {
        assert_eq!(parse_content_range_start("bytes 100-199/1000"), Some(100));
        assert_eq!(parse_content_range_start("bytes 0-9/*"), Some(0));
        assert_eq!(parse_content_range_start("bytes */1000"), None);
        assert_eq!(parse_content_range_start("garbage"), None);
    }

    #[test]
    fn test_default_user_agent() {
        assert_eq!(DEFAULT_USER_AGENT, "Mozilla/5.0");
    }
}
