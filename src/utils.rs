//! Common formatting helpers for command output.
//!
//! - [`format_count`] - Format counts with K/M suffix (1.5K, 2.3M)
//! - [`format_remaining`] - Format a duration as "1h 5m"
//! - [`truncate`] - Truncate strings with ellipsis

use std::time::Duration;

/// Format a count with K/M suffix for compact display.
///
/// # Examples
/// ```
/// use banwatch::utils::format_count;
/// assert_eq!(format_count(500), "500");
/// assert_eq!(format_count(1500), "1.5K");
/// assert_eq!(format_count(1_500_000), "1.5M");
/// ```
pub fn format_count(count: u64) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Two most significant units of a duration.
///
/// # Examples
/// ```
/// use banwatch::utils::format_remaining;
/// use std::time::Duration;
/// assert_eq!(format_remaining(Duration::from_secs(3_900)), "1h 5m");
/// assert_eq!(format_remaining(Duration::from_secs(42)), "42s");
/// ```
pub fn format_remaining(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins, s) = (
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, s)
    } else {
        format!("{}s", s)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if truncated.
///
/// # Examples
/// ```
/// use banwatch::utils::truncate;
/// assert_eq!(truncate("short", 10), "short");
/// assert_eq!(truncate("this is long", 10), "this is...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
