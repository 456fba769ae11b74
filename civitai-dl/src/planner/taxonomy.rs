//! Tag-driven classification.
//!
//! Models are slotted under one of the canonical categories by matching
//! their tag set against a keyword table. An exact match of the category
//! name itself within the tag set always wins; otherwise any keyword
//! matching as a substring of any tag decides; otherwise `MISC`.
//!
//! Classification is a pure function of (tags, table) — it must never
//! depend on time or on the order models are processed.

/// Fallback category for unclassifiable models.
pub const MISC_CATEGORY: &str = "MISC";

/// Category -> keyword table.
///
/// Entries are evaluated in insertion order, which makes the result
/// deterministic when several categories could match.
#[derive(Clone, Debug)]
pub struct TagTable {
    entries: Vec<(String, Vec<String>)>,
}

impl TagTable {
    /// Builds a table from (category, keywords) pairs.
    pub fn new(entries: Vec<(String, Vec<String>)>) -> Self {
        Self { entries }
    }

    /// Classifies a model's tag set into a category name.
    pub fn classify(&self, tags: &[String]) -> String {
        if tags.is_empty() {
            return MISC_CATEGORY.to_string();
        }

        let normalized: Vec<String> = tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .collect();

        // Exact match: the category name itself appears as a tag.
        for (category, _) in &self.entries {
            if normalized.iter().any(|t| t == &category.to_lowercase()) {
                return category.clone();
            }
        }

        // Substring match on any keyword within any tag.
        for (category, keywords) in &self.entries {
            for keyword in keywords {
                let keyword = keyword.to_lowercase();
                if normalized.iter().any(|t| t.contains(&keyword)) {
                    return category.clone();
                }
            }
        }

        MISC_CATEGORY.to_string()
    }

    /// Canonical category names, in evaluation order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }
}

impl Default for TagTable {
    /// The canonical classification table.
    fn default() -> Self {
        let table: &[(&str, &[&str])] = &[
            ("CONCEPT", &["concept", "concepts", "technique"]),
            ("CHARACTER", &["character", "characters", "person", "celebrity"]),
            ("STYLE", &["style", "styles", "art style", "artist"]),
            ("POSE", &["pose", "poses", "position", "posing"]),
            ("CLOTHING", &["clothing", "outfit", "clothes", "dress"]),
            ("OBJECT", &["object", "objects", "item", "tool"]),
            ("BACKGROUND", &["background", "scene", "location", "environment"]),
            ("ANIMAL", &["animal", "animals", "creature"]),
            ("VEHICLE", &["vehicle", "car", "airplane", "ship"]),
        ];
        Self::new(
            table
                .iter()
                .map(|(c, ks)| {
                    (
                        c.to_string(),
                        ks.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_category_tag_wins() {
        let table = TagTable::default();
        // "style" is a STYLE keyword, but the exact tag "character" names
        // the CHARACTER category and is checked first.
        assert_eq!(
            table.classify(&tags(&["style", "character"])),
            "CHARACTER"
        );
    }

    #[test]
    fn test_keyword_substring_match() {
        let table = TagTable::default();
        assert_eq!(table.classify(&tags(&["anime art style"])), "STYLE");
        assert_eq!(table.classify(&tags(&["sports car"])), "VEHICLE");
    }

    #[test]
    fn test_case_insensitive() {
        let table = TagTable::default();
        assert_eq!(table.classify(&tags(&["CHARACTER"])), "CHARACTER");
        assert_eq!(table.classify(&tags(&["  Animals  "])), "ANIMAL");
    }

    #[test]
    fn test_unmatched_tags_fall_back_to_misc() {
        let table = TagTable::default();
        assert_eq!(table.classify(&tags(&["sd15", "photorealistic"])), "MISC");
        assert_eq!(table.classify(&[]), "MISC");
    }

    #[test]
    fn test_deterministic_for_identical_input() {
        let table = TagTable::default();
        let input = tags(&["outfit", "background"]);
        let first = table.classify(&input);
        for _ in 0..10 {
            assert_eq!(table.classify(&input), first);
        }
        assert_eq!(first, "CLOTHING");
    }
}
