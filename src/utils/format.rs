//! Human-readable sizes, speeds and durations

/// Format bytes as B/KB/MB/GB
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_file_size(bytes_per_second.max(0.0) as u64))
}

/// `"Ns"`, `"Mm Ss"`, `"Hh Mm"`, or `"--"` when unknown
pub fn format_remaining_time(seconds: Option<u64>) -> String {
    match seconds {
        None => "--".to_string(),
        Some(s) if s < 60 => format!("{}s", s),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}
