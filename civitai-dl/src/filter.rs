//! Base-model whitelist filter.
//!
//! Opt-in gate evaluated against version metadata. Matching is
//! case-insensitive substring: a version is admitted when any whitelist
//! entry occurs within its `baseModel` label. Versions without a
//! `baseModel` are rejected while filtering is active.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Whitelist gate plus accept/reject accounting for the progress stream.
#[derive(Debug, Default)]
pub struct BaseModelFilter {
    /// Lowercased whitelist entries; empty means the filter is inactive.
    entries: Vec<String>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl BaseModelFilter {
    /// Builds a filter from whitelist entries. Blank entries are dropped;
    /// an empty list yields an inactive (accept-everything) filter.
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Inactive filter: admits everything, counts nothing.
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Evaluates a version's `baseModel` label against the whitelist.
    pub fn admit(&self, base_model: Option<&str>) -> bool {
        if !self.is_active() {
            return true;
        }

        let admitted = match base_model {
            Some(label) => {
                let label = label.to_lowercase();
                self.entries.iter().any(|entry| label.contains(entry))
            }
            // No label to compare against while filtering is active.
            None => false,
        };

        if admitted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(base_model = ?base_model, "version rejected by base-model filter");
        }
        admitted
    }

    /// (accepted, rejected) counts since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(entries: &[&str]) -> BaseModelFilter {
        BaseModelFilter::new(entries.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_inactive_filter_admits_everything() {
        let f = BaseModelFilter::inactive();
        assert!(!f.is_active());
        assert!(f.admit(Some("SDXL 1.0")));
        assert!(f.admit(None));
        assert_eq!(f.stats(), (0, 0));
    }

    #[test]
    fn test_substring_match_case_insensitive() {
        let f = filter(&["Illustrious", "Pony"]);
        assert!(!f.admit(Some("SDXL 1.0")));
        assert!(f.admit(Some("Pony Diffusion V6 XL")));
        assert!(f.admit(Some("illustrious")));
        assert_eq!(f.stats(), (2, 1));
    }

    #[test]
    fn test_missing_base_model_rejected_while_active() {
        let f = filter(&["Pony"]);
        assert!(!f.admit(None));
        assert_eq!(f.stats(), (0, 1));
    }

    #[test]
    fn test_blank_entries_ignored() {
        let f = filter(&["", "  "]);
        assert!(!f.is_active());
    }
}
