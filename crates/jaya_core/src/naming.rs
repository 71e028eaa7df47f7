//! Conversions between article titles and file names.
//!
//! Titles become file names by swapping spaces for underscores. The reverse
//! direction drops everything after the first `.` and swaps underscores back,
//! so a title that already contains `.` or `_` does not survive the round
//! trip.

pub const EXTENSION_DELIMITER: char = '.';

pub fn filesystem_safe(title: &str) -> String {
    title.replace(' ', "_")
}

pub fn filesystem_to_pretty(file_name: &str) -> String {
    let stem = file_name
        .split(EXTENSION_DELIMITER)
        .next()
        .unwrap_or_default();
    stem.replace('_', " ")
}

/// True when `name` normalizes to exactly `safe_name`.
pub fn names_are_equal(name: &str, safe_name: &str) -> bool {
    filesystem_safe(name) == safe_name
}

/// Split a file name at its last delimiter, so `v1.2_notes.md` keeps the stem
/// `v1.2_notes`. Dotfiles keep their full name as the stem.
pub fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    if file_name.starts_with(EXTENSION_DELIMITER) {
        return (file_name, None);
    }
    match file_name.rfind(EXTENSION_DELIMITER) {
        None => (file_name, None),
        Some(index) => {
            let extension = &file_name[index + 1..];
            let extension = if extension.is_empty() {
                None
            } else {
                Some(extension)
            };
            (&file_name[..index], extension)
        }
    }
}

pub fn article_file_name(stem: &str, extension: &str) -> String {
    let extension = extension.trim_start_matches(EXTENSION_DELIMITER);
    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}{EXTENSION_DELIMITER}{extension}")
    }
}

pub fn fixture_file_name(stem: &str) -> String {
    format!("{stem}.json")
}
