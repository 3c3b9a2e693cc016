//! M3U8 playlist parsing utilities
//!
//! A line-oriented scanner that turns HLS playlist text into a [`Manifest`]. The
//! parser is stateless between calls; within one call it carries the pending
//! `#EXTINF` duration and the `#EXT-X-KEY` in force until a new key replaces it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use url::Url;

use crate::core::error_handling::{errors, DownloadError};

/// Required first tag of every playlist
pub const HEADER_TAG: &str = "#EXTM3U";

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF";
const KEY_TAG: &str = "#EXT-X-KEY:";
const MAP_TAG: &str = "#EXT-X-MAP:";
const EXTINF_TAG: &str = "#EXTINF:";
const TARGET_DURATION_TAG: &str = "#EXT-X-TARGETDURATION:";
const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";

/// Encryption descriptor from an `#EXT-X-KEY` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub method: String,
    /// Absolute key URL
    pub key_url: Option<String>,
    /// Raw IV attribute, usually `0x` + 32 hex digits
    pub iv: Option<String>,
}

impl EncryptionInfo {
    pub fn is_encrypted(&self) -> bool {
        !self.method.is_empty() && !self.method.eq_ignore_ascii_case("NONE")
    }

    pub fn is_aes128(&self) -> bool {
        self.method.eq_ignore_ascii_case("AES-128")
    }
}

/// One media segment in playlist order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub url: String,
    pub duration: f64,
    pub index: usize,
    pub encryption: Option<EncryptionInfo>,
}

/// Parsed playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub source_url: String,
    /// Directory of `source_url`, used for relative URIs
    pub base_url: String,
    pub segments: Vec<Segment>,
    /// Set when an `#EXT-X-STREAM-INF` tag was seen
    pub is_master: bool,
    pub variant_urls: Vec<String>,
    /// First encrypting key tag of the playlist
    pub encryption: Option<EncryptionInfo>,
    pub init_segment_url: Option<String>,
    pub target_duration: Option<f64>,
    pub has_end_list: bool,
}

impl Manifest {
    pub fn first_variant(&self) -> Option<&str> {
        self.variant_urls.first().map(String::as_str)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.as_ref().map_or(false, EncryptionInfo::is_encrypted)
            || self
                .segments
                .iter()
                .any(|s| s.encryption.as_ref().map_or(false, EncryptionInfo::is_encrypted))
    }
}

fn extinf_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#EXTINF:\s*([\d.]+)").expect("valid EXTINF regex"))
}

fn method_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"METHOD=([^,\s]+)").expect("valid METHOD regex"))
}

fn uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"URI="([^"]+)""#).expect("valid URI regex"))
}

fn iv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"IV=([^,\s]+)").expect("valid IV regex"))
}

/// Parse playlist `text` fetched from `source_url`
pub fn parse(text: &str, source_url: &str) -> Result<Manifest, DownloadError> {
    let first_line = text.lines().map(str::trim).find(|line| !line.is_empty());
    if !first_line.map_or(false, |line| line.starts_with(HEADER_TAG)) {
        return Err(errors::format_error(format!(
            "playlist does not start with {}",
            HEADER_TAG
        )));
    }

    let base_url = base_url_of(source_url);
    let mut manifest = Manifest {
        source_url: source_url.to_string(),
        base_url: base_url.clone(),
        segments: Vec::new(),
        is_master: false,
        variant_urls: Vec::new(),
        encryption: None,
        init_segment_url: None,
        target_duration: None,
        has_end_list: false,
    };

    let mut pending_duration = 0.0_f64;
    let mut current_encryption: Option<EncryptionInfo> = None;
    let mut expecting_variant = false;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            if line.starts_with(STREAM_INF_TAG) {
                manifest.is_master = true;
                expecting_variant = true;
            } else if line.starts_with(KEY_TAG) {
                let info = parse_key_line(line, &base_url)?;
                current_encryption = info.filter(EncryptionInfo::is_encrypted);
                if manifest.encryption.is_none() {
                    manifest.encryption = current_encryption.clone();
                }
            } else if line.starts_with(MAP_TAG) {
                if manifest.init_segment_url.is_none() {
                    if let Some(uri) = uri_regex().captures(line).and_then(|c| c.get(1)) {
                        manifest.init_segment_url = Some(resolve_url(&base_url, uri.as_str())?);
                    }
                }
            } else if line.starts_with(EXTINF_TAG) {
                pending_duration = extinf_regex()
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or(0.0);
            } else if let Some(value) = line.strip_prefix(TARGET_DURATION_TAG) {
                manifest.target_duration = value.trim().parse::<f64>().ok();
            } else if line.starts_with(ENDLIST_TAG) {
                manifest.has_end_list = true;
            }
            continue;
        }

        if expecting_variant {
            manifest.variant_urls.push(resolve_url(&base_url, line)?);
            expecting_variant = false;
            continue;
        }

        let index = manifest.segments.len();
        manifest.segments.push(Segment {
            url: resolve_url(&base_url, line)?,
            duration: pending_duration,
            index,
            encryption: current_encryption.clone(),
        });
        pending_duration = 0.0;
    }

    tracing::debug!(
        "解析完成: {} 个片段, {} 个变体流, 总时长: {:.2}秒",
        manifest.segments.len(),
        manifest.variant_urls.len(),
        manifest.total_duration()
    );

    Ok(manifest)
}

fn parse_key_line(line: &str, base_url: &str) -> Result<Option<EncryptionInfo>, DownloadError> {
    let method = match method_regex().captures(line).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().to_string(),
        None => return Ok(None),
    };

    let key_url = match uri_regex().captures(line).and_then(|c| c.get(1)) {
        Some(uri) => Some(resolve_url(base_url, uri.as_str())?),
        None => None,
    };
    let iv = iv_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    Ok(Some(EncryptionInfo {
        method,
        key_url,
        iv,
    }))
}

/// Text of `url` up to and including the final `/` of its path
pub fn base_url_of(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let without_query = &url[..end];
    let path_start = without_query.find("://").map(|i| i + 3).unwrap_or(0);

    match without_query[path_start..].rfind('/') {
        Some(pos) => without_query[..path_start + pos + 1].to_string(),
        None => format!("{}/", without_query),
    }
}

/// Resolve a playlist URI against the directory `base_url`
///
/// - `http(s)://...` passes through
/// - `//host/...` takes the scheme of the base
/// - `/path` takes scheme, host and port of the base
/// - anything else is appended to the base directory
pub fn resolve_url(base_url: &str, relative: &str) -> Result<String, DownloadError> {
    let relative = relative.trim();
    if relative.is_empty() {
        return Ok(String::new());
    }

    let lower = relative.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(relative.to_string());
    }

    if relative.starts_with("//") {
        let base = parse_base(base_url)?;
        return Ok(format!("{}:{}", base.scheme(), relative));
    }

    if relative.starts_with('/') {
        let base = parse_base(base_url)?;
        let host = base.host_str().ok_or_else(|| {
            errors::format_error(format!("base URL has no host: {}", base_url))
        })?;
        let port = base.port().map(|p| format!(":{}", p)).unwrap_or_default();
        return Ok(format!("{}://{}{}{}", base.scheme(), host, port, relative));
    }

    Ok(format!("{}{}", base_url_of(base_url), relative))
}

fn parse_base(base_url: &str) -> Result<Url, DownloadError> {
    Url::parse(base_url).map_err(|e| {
        errors::format_error(format!("cannot resolve against base {}: {}", base_url, e))
    })
}

/// URL shape hint: `.m3u8` extension or a common HLS path/query marker
pub fn looks_like_manifest_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains(".m3u8") || lower.contains("/hls/") || lower.contains("format=m3u8")
}

pub fn looks_like_manifest_content(text: &str) -> bool {
    text.trim_start().starts_with(HEADER_TAG)
}
