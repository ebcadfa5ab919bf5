//! Text helpers shared by ingestion, dispatch and the CLI

use std::borrow::Cow;
use std::path::Path;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref SOURCE_SEPARATOR_REGEX: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// Separator used in normalized source names.
pub const SOURCE_SEPARATOR: char = '_';

pub struct TextUtils;

impl TextUtils {
    /// Lower-cases and collapses every run of non-alphanumeric characters into a
    /// single `_`, trimming separators at either end. Empty output means the name
    /// carries nothing usable.
    pub fn normalize_source_name(raw: &str) -> String {
        let lowered = raw.to_lowercase();
        let collapsed = SOURCE_SEPARATOR_REGEX.replace_all(&lowered, "_");
        collapsed.trim_matches(SOURCE_SEPARATOR).to_string()
    }

    /// Source name suggested for a file: its stem up to the first dot, normalized.
    pub fn suggest_source_name(file_name: &str) -> String {
        let base = Path::new(file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = base.split('.').next().unwrap_or_default();
        Self::normalize_source_name(stem)
    }

    /// Truncate to at most `max_chars` characters, ending with an ellipsis when cut.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}
