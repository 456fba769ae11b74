//! Path-segment sanitization.
//!
//! Remote names flow straight into directory and file names, so every
//! segment is scrubbed: forbidden and control characters become `_`,
//! leading/trailing whitespace and dots are stripped, and segments are
//! capped at 200 characters while preserving the file extension.

/// Maximum length of a single path segment, in characters.
pub const MAX_SEGMENT_LEN: usize = 200;

/// Characters forbidden on at least one supported filesystem.
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn is_control(c: char) -> bool {
    let code = c as u32;
    code < 0x20 || (0x7f..=0x9f).contains(&code)
}

/// Sanitizes one path segment (a directory or file name, never a path).
///
/// Empty results fall back to `"unnamed"`.
pub fn sanitize_segment(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || is_control(c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    truncate_segment(trimmed, MAX_SEGMENT_LEN)
}

/// Truncates a segment to `max` characters, keeping the extension intact
/// when one exists and fits.
pub fn truncate_segment(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }

    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = name.split_at(dot);
            let ext_len = ext.chars().count();
            if ext_len >= max {
                // Degenerate extension; plain truncation.
                return name.chars().take(max).collect();
            }
            let stem_budget = max - ext_len;
            let stem: String = stem.chars().take(stem_budget).collect();
            format!("{stem}{ext}")
        }
        _ => name.chars().take(max).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_chars_replaced() {
        assert_eq!(sanitize_segment("a<b>c:d\"e/f\\g|h?i*j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn test_control_chars_replaced() {
        assert_eq!(sanitize_segment("a\x00b\x1fc\x7fd"), "a_b_c_d");
    }

    #[test]
    fn test_leading_trailing_dots_and_space_stripped() {
        assert_eq!(sanitize_segment("  ..name..  "), "name");
        assert_eq!(sanitize_segment("..."), "unnamed");
        assert_eq!(sanitize_segment(""), "unnamed");
    }

    #[test]
    fn test_inner_dots_preserved() {
        assert_eq!(sanitize_segment("v1.5 final.safetensors"), "v1.5 final.safetensors");
    }

    #[test]
    fn test_truncation_preserves_extension() {
        let long = format!("{}.safetensors", "x".repeat(300));
        let out = sanitize_segment(&long);
        assert_eq!(out.chars().count(), MAX_SEGMENT_LEN);
        assert!(out.ends_with(".safetensors"));
    }

    #[test]
    fn test_truncation_without_extension() {
        let long = "y".repeat(250);
        let out = sanitize_segment(&long);
        assert_eq!(out.chars().count(), MAX_SEGMENT_LEN);
    }

    #[test]
    fn test_multibyte_names_counted_in_chars() {
        let long = "総".repeat(250);
        let out = sanitize_segment(&long);
        assert_eq!(out.chars().count(), MAX_SEGMENT_LEN);
    }
}
