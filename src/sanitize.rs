use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_TITLE_CHARS: usize = 120;
pub const MAX_DESCRIPTION_CHARS: usize = 1000;
pub const MAX_CATEGORY_NAME_CHARS: usize = 40;
pub const MAX_FILE_NAME_CHARS: usize = 255;
pub const DEFAULT_CATEGORY_COLOR: &str = "#64748b";
pub const MIN_PROGRESS: i64 = 0;
pub const MAX_PROGRESS: i64 = 100;

static COLOR_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid regex"));

/// Trimmed, control-free, at most 120 chars. Empty means the input is rejected.
pub fn sanitize_title(raw: &str) -> String {
    single_line(raw, MAX_TITLE_CHARS)
}

pub fn sanitize_description(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = normalized
        .chars()
        .filter(|ch| *ch == '\n' || *ch == '\t' || !ch.is_control())
        .collect();
    truncate_chars(stripped.trim(), MAX_DESCRIPTION_CHARS)
}

pub fn sanitize_category_name(raw: &str) -> String {
    single_line(raw, MAX_CATEGORY_NAME_CHARS)
}

pub fn sanitize_color(raw: &str) -> String {
    let trimmed = raw.trim();
    if COLOR_PATTERN.is_match(trimmed) {
        trimmed.to_ascii_lowercase()
    } else {
        DEFAULT_CATEGORY_COLOR.to_string()
    }
}

/// Basename of a client-supplied file name.
pub fn sanitize_file_name(raw: &str) -> String {
    let basename = raw.rsplit(|ch| ch == '/' || ch == '\\').next().unwrap_or_default();
    single_line(basename, MAX_FILE_NAME_CHARS)
}

pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(MIN_PROGRESS, MAX_PROGRESS) as u8
}

pub fn parse_progress(raw: &str) -> Option<u8> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(clamp_progress(value));
    }
    // range inputs sometimes post fractional values
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| clamp_progress(value.round() as i64))
}

/// Case-insensitive comparison key for names.
pub fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

fn single_line(raw: &str, max_chars: usize) -> String {
    let stripped: String = raw.trim().chars().filter(|ch| !ch.is_control()).collect();
    truncate_chars(stripped.trim(), max_chars)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => value[..cut].to_string(),
        None => value.to_string(),
    }
}
