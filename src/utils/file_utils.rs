//! File system utilities

use std::path::Path;
use url::Url;

/// Longest base name kept before the timestamp suffix
pub const MAX_BASE_NAME_CHARS: usize = 100;

const KNOWN_EXTENSIONS: [&str; 9] = ["mp4", "mkv", "avi", "flv", "wmv", "mov", "m4v", "ts", "m3u8"];

/// Get file extension
pub fn get_file_extension(filename: &str) -> Option<&str> {
    Path::new(filename).extension().and_then(|ext| ext.to_str())
}

/// Sanitize filename for filesystem
pub fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `"{vod}_{episode}"` sanitized and capped, `"vod_episode"` when both labels are blank
pub fn build_base_name(vod_name: &str, episode_name: &str) -> String {
    let vod = vod_name.trim();
    let episode = episode_name.trim();

    let raw = if vod.is_empty() && episode.is_empty() {
        "vod_episode".to_string()
    } else {
        format!("{}_{}", vod, episode)
    };

    sanitize_filename(&raw)
        .chars()
        .take(MAX_BASE_NAME_CHARS)
        .collect()
}

/// Known media extension of the URL path, lowercased
pub fn url_media_extension(url: &str) -> Option<String> {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());

    let last_segment = path.rsplit('/').next().unwrap_or_default();
    get_file_extension(last_segment)
        .map(str::to_ascii_lowercase)
        .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
}

/// Extension for the output file; manifests always become mp4
pub fn output_extension(url: &str, is_manifest: bool) -> String {
    if is_manifest {
        return "mp4".to_string();
    }
    url_media_extension(url).unwrap_or_else(|| "mp4".to_string())
}

/// `"{base}_{millis}.{ext}"`
pub fn generate_file_name(
    vod_name: &str,
    episode_name: &str,
    url: &str,
    is_manifest: bool,
    timestamp_millis: i64,
) -> String {
    format!(
        "{}_{}.{}",
        build_base_name(vod_name, episode_name),
        timestamp_millis,
        output_extension(url, is_manifest)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
        assert_eq!(sanitize_filename("   "), "video");
    }

    #[test]
    fn test_base_name_rules() {
        assert_eq!(build_base_name("Show", "E01"), "Show_E01");
        assert_eq!(build_base_name("", ""), "vod_episode");
        assert_eq!(build_base_name("剧集", "第1集"), "剧集_第1集");

        let long = "x".repeat(150);
        assert_eq!(build_base_name(&long, "").chars().count(), MAX_BASE_NAME_CHARS);
    }

    #[test]
    fn test_output_extension() {
        assert_eq!(output_extension("https://h/a/movie.MKV?token=1", false), "mkv");
        assert_eq!(output_extension("https://h/a/clip.ts", false), "ts");
        assert_eq!(output_extension("https://h/a/file.bin", false), "mp4");
        assert_eq!(output_extension("https://h/a/noext", false), "mp4");
        assert_eq!(output_extension("https://h/a/index.m3u8", true), "mp4");
        assert_eq!(url_media_extension("https://h/play.php?id=3"), None);
    }

    #[test]
    fn test_generate_file_name() {
        let name = generate_file_name("Show", "E01", "https://h/v.mov", false, 1700000000000);
        assert_eq!(name, "Show_E01_1700000000000.mov");
    }
}
