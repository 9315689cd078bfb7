pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Render a unix timestamp as UTC text
pub fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Invalid date".to_string())
}

/// Default output path for a deblended catalog: `cat.json` -> `cat.deblended.json`
pub fn deblended_path(catalog: &str) -> String {
    match catalog.strip_suffix(".json") {
        Some(stem) => format!("{}.deblended.json", stem),
        None => format!("{}.deblended.json", catalog),
    }
}
