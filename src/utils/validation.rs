//! URL and input validation utilities

use url::Url;

use crate::core::error_handling::{errors, DownloadError};

/// Parse `url` and require an http(s) scheme
pub fn validate_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| errors::format_error(format!("Invalid URL format: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(errors::format_error(format!(
            "Unsupported URL scheme: {}",
            other
        ))),
    }
}
