use chrono::{DateTime, Local, Utc};

/// ANSI color codes
#[allow(dead_code)]
pub struct Color;

#[allow(dead_code)]
impl Color {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
}

/// Wrap `text` in a color when coloring is on
pub fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("{}{}{}", color, text, Color::RESET)
    } else {
        text.to_string()
    }
}

/// Left-aligned "label: value" row
pub fn field(label: &str, value: impl std::fmt::Display, use_color: bool) -> String {
    let label = format!("{:<18}", format!("{}:", label));
    format!("{} {}", paint(&label, Color::DIM, use_color), value)
}

pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{} B", bytes)
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}

/// Usage ratio colored by how close it is to the quota
pub fn usage_ratio(ratio: f64, warning: f64, critical: f64, use_color: bool) -> String {
    let text = format!("{:.1}%", ratio * 100.0);
    let color = if ratio >= critical {
        Color::RED
    } else if ratio >= warning {
        Color::YELLOW
    } else {
        Color::GREEN
    };
    paint(&text, color, use_color)
}
