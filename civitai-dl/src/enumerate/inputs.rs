//! Input-list parsing.
//!
//! User lists, model lists, and filter lists share one shape: UTF-8 text,
//! one entry per line, `#` comments and blank lines ignored. User and
//! model entries may be fully-qualified URLs; they are stripped down to
//! the handle / identifier.

use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Reads a list file, dropping blanks and `#` comments.
pub fn parse_list_file(path: &Path) -> EngineResult<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    Ok(parse_list(&content))
}

/// Parses list content (one entry per line).
pub fn parse_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Reduces a user entry to a bare handle.
///
/// Accepts `https://civitai.com/user/<handle>[/...]` URLs or bare handles.
pub fn normalize_user_entry(entry: &str) -> String {
    let entry = entry.trim().trim_end_matches('/');
    for prefix in [
        "https://civitai.com/user/",
        "http://civitai.com/user/",
        "https://www.civitai.com/user/",
    ] {
        if let Some(rest) = entry.strip_prefix(prefix) {
            // Drop any trailing path (e.g. /models, /images).
            return rest.split('/').next().unwrap_or(rest).to_string();
        }
    }
    entry.to_string()
}

/// Reduces a model entry to its numeric identifier.
///
/// Accepts bare ids or `https://civitai.com/models/<id>[/slug][?query]`.
pub fn normalize_model_entry(entry: &str) -> Option<u64> {
    let entry = entry.trim();
    if let Ok(id) = entry.parse::<u64>() {
        return Some(id);
    }

    let marker = "/models/";
    let start = entry.find(marker)? + marker.len();
    let rest = &entry[start..];
    let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_comments_and_blanks() {
        let content = "# header\n\nalice\n  bob  \n# trailing\n";
        assert_eq!(parse_list(content), vec!["alice", "bob"]);
    }

    #[test]
    fn test_normalize_user_entry() {
        assert_eq!(normalize_user_entry("alice"), "alice");
        assert_eq!(
            normalize_user_entry("https://civitai.com/user/alice"),
            "alice"
        );
        assert_eq!(
            normalize_user_entry("https://civitai.com/user/alice/models"),
            "alice"
        );
        assert_eq!(
            normalize_user_entry("https://civitai.com/user/alice/"),
            "alice"
        );
    }

    #[test]
    fn test_normalize_model_entry() {
        assert_eq!(normalize_model_entry("12345"), Some(12345));
        assert_eq!(
            normalize_model_entry("https://civitai.com/models/9876/neon-city"),
            Some(9876)
        );
        assert_eq!(
            normalize_model_entry("https://civitai.com/models/42?modelVersionId=7"),
            Some(42)
        );
        assert_eq!(normalize_model_entry("not-an-id"), None);
        assert_eq!(normalize_model_entry("https://civitai.com/models/"), None);
    }
}
