// 🔤 Name Normalization - canonical forms for comparison
//
// normalize():   "  El Millón " → "el millon"
// VariantRule:   known alternate spellings → one canonical display form
//
// Rules are data (like classification rules): a pattern matched against the
// normalized name, with `*` as a wildcard.

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::entities::{LocationNode, LocationPatch};
use crate::error::ValidationError;

/// Strip diacritics, lower-case, trim, collapse inner whitespace
pub fn normalize(raw: &str) -> String {
    let stripped: String = raw.nfd().filter(|c| !is_combining_mark(*c)).collect();

    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// VARIANT RULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRule {
    /// Pattern over the normalized name (supports wildcards with *)
    pub pattern: String,

    /// Display form every matching node is rewritten to
    pub canonical_form: String,
}

impl VariantRule {
    pub fn new(pattern: &str, canonical_form: &str) -> Result<Self, ValidationError> {
        let rule = VariantRule {
            pattern: pattern.to_string(),
            canonical_form: canonical_form.to_string(),
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Reject rules that would match everything or rewrite to nothing
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.canonical_form.trim().is_empty() {
            return Err(ValidationError::InvalidRule(
                "canonical form is empty".to_string(),
            ));
        }
        if normalize(&self.pattern).chars().all(|c| c == '*') {
            return Err(ValidationError::InvalidRule(format!(
                "pattern {:?} matches every name",
                self.pattern
            )));
        }
        Ok(())
    }

    /// Check if the pattern matches the given name (both sides normalized)
    pub fn matches(&self, name: &str) -> bool {
        let pattern = normalize(&self.pattern);
        let text = normalize(name);

        if !pattern.contains('*') {
            return pattern == text;
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let first = parts[0];
        let last = parts[parts.len() - 1];

        if !text.starts_with(first) || !text.ends_with(last) {
            return false;
        }
        if first.len() + last.len() > text.len() {
            return false;
        }

        // Middle parts must appear in order between the anchors
        let mut pos = first.len();
        let end = text.len() - last.len();
        for part in &parts[1..parts.len() - 1] {
            if part.is_empty() {
                continue;
            }
            match text[pos..end].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }

        true
    }

    /// The rewrite for `node`, if the rule matches and the node is not already
    /// spelled exactly as the canonical form
    pub fn apply_to(&self, node: &LocationNode) -> Option<LocationPatch> {
        if !self.matches(&node.name) {
            return None;
        }

        let canonical_name = normalize(&self.canonical_form);
        if node.name == self.canonical_form
            && node.display_name == self.canonical_form
            && node.canonical_name == canonical_name
        {
            return None;
        }

        Some(LocationPatch::rename(&self.canonical_form))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::LocationType;

    #[test]
    fn test_normalize_strips_diacritics() {
        assert_eq!(normalize("El Millón"), "el millon");
        assert_eq!(normalize("Bávaro"), "bavaro");
        assert_eq!(normalize("Peñalver"), "penalver");
        assert_eq!(normalize("SAN CRISTÓBAL"), "san cristobal");
    }

    #[test]
    fn test_normalize_trims_and_collapses_whitespace() {
        assert_eq!(normalize("  Piantini  "), "piantini");
        assert_eq!(normalize("Los   Prados\t"), "los prados");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_same_key_for_accent_variants() {
        assert_eq!(normalize("El Millon"), normalize("El Millón"));
        assert_ne!(normalize("El Millon"), normalize("El Milloncito"));
    }

    #[test]
    fn test_exact_rule_match() {
        let rule = VariantRule::new("sto dgo este", "Santo Domingo Este").unwrap();

        assert!(rule.matches("Sto Dgo Este"));
        assert!(!rule.matches("STO. DGO ESTE"));
        assert!(!rule.matches("Santo Domingo Este"));
    }

    #[test]
    fn test_wildcard_rule_match() {
        let rule = VariantRule::new("sto* dgo* este", "Santo Domingo Este").unwrap();

        assert!(rule.matches("Sto. Dgo. Este"));
        assert!(rule.matches("Sto Dgo Este"));
        assert!(!rule.matches("Sto Dgo Oeste"));
    }

    #[test]
    fn test_rule_rejects_catch_all_pattern() {
        assert!(VariantRule::new("*", "Anything").is_err());
        assert!(VariantRule::new("naco", "  ").is_err());
    }

    #[test]
    fn test_apply_to_skips_already_canonical() {
        let rule = VariantRule::new("ensanche naco*", "Ensanche Naco").unwrap();

        let canonical = LocationNode::new("Ensanche Naco", LocationType::Sector, None);
        assert!(rule.apply_to(&canonical).is_none());

        let variant = LocationNode::new("ENSANCHE NACO", LocationType::Sector, None);
        let patch = rule.apply_to(&variant).unwrap();
        assert_eq!(patch.name.as_deref(), Some("Ensanche Naco"));
        assert_eq!(patch.canonical_name.as_deref(), Some("ensanche naco"));
    }
}
