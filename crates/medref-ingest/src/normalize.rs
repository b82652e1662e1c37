//! Record validation and canonical-key derivation
//!
//! Validators convert source-specific payloads into the source-agnostic
//! [`NormalizedRecord`] shape, rejecting malformed records. The canonical
//! key derived here is the grouping identity for consolidation: trivial
//! spelling and formulation differences must map to the same key, while
//! genuinely distinct subjects must not.

use crate::error::ValidationError;
use crate::models::{NormalizedRecord, RawRecord};

/// Per-source record validator/normalizer
pub trait RecordValidator: Send + Sync {
    /// Stable identifier matching the source's configuration entry
    fn source_id(&self) -> &str;

    /// Convert a raw payload into the canonical intermediate shape
    fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, ValidationError>;
}

/// Formulation and dose-form tokens stripped from the end of a subject key.
/// Only trailing tokens are removed so substance names stay intact.
const FORMULATION_SUFFIXES: &[&str] = &[
    "tablet",
    "tablets",
    "capsule",
    "capsules",
    "injection",
    "injectable",
    "solution",
    "suspension",
    "syrup",
    "cream",
    "ointment",
    "gel",
    "patch",
    "spray",
    "oral",
    "topical",
    "extended",
    "delayed",
    "release",
    "er",
    "xr",
    "sr",
    "dr",
];

/// Derive the canonical grouping key from a subject key
///
/// Idempotent and case/format-insensitive: lowercases, replaces
/// punctuation with spaces, collapses whitespace, then strips trailing
/// formulation tokens. A key that would strip to nothing keeps its
/// unstripped form.
pub fn canonical_key(subject_key: &str) -> String {
    let cleaned: String = subject_key
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    let mut end = tokens.len();
    while end > 0 && FORMULATION_SUFFIXES.contains(&tokens[end - 1]) {
        end -= 1;
    }

    if end == 0 {
        tokens.join(" ")
    } else {
        tokens[..end].join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive() {
        assert_eq!(canonical_key("Drug A"), canonical_key("drug a"));
        assert_eq!(canonical_key("METFORMIN"), "metformin");
    }

    #[test]
    fn test_punctuation_and_whitespace_collapse() {
        assert_eq!(canonical_key("aspirin,  low-dose"), "aspirin low dose");
        assert_eq!(canonical_key("  warfarin  sodium "), "warfarin sodium");
    }

    #[test]
    fn test_formulation_suffixes_stripped() {
        assert_eq!(canonical_key("Metformin HCl Tablets"), "metformin hcl");
        assert_eq!(
            canonical_key("metformin hcl extended release"),
            "metformin hcl"
        );
        assert_eq!(canonical_key("Lidocaine Topical Cream"), "lidocaine");
    }

    #[test]
    fn test_idempotent() {
        let once = canonical_key("Metformin HCl Tablets");
        assert_eq!(canonical_key(&once), once);
    }

    #[test]
    fn test_distinct_subjects_stay_distinct() {
        assert_ne!(canonical_key("warfarin"), canonical_key("metformin"));
        assert_ne!(
            canonical_key("amoxicillin"),
            canonical_key("amoxicillin clavulanate")
        );
    }

    #[test]
    fn test_all_suffix_key_not_emptied() {
        // A name made entirely of suffix tokens keeps its unstripped form
        assert_eq!(canonical_key("Solution"), "solution");
    }
}
