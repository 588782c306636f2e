//! Error types and utilities for the butterfly-osm accessibility tools
//!
//! Every failure a run can hit is terminal: configuration problems abort before
//! any computation starts, lookup and computation failures abort the job at the
//! first occurrence, and distribution failures abort the whole job. Nothing in
//! this taxonomy is downgraded to a warning.

use strsim::{jaro_winkler, normalized_levenshtein};
use thiserror::Error;

/// Minimum combined similarity for a suggestion to be offered.
///
/// Catches `"k-8_12"` vs `"k-8_21"` while staying silent on unrelated names.
const MIN_SUGGESTION_SCORE: f64 = 0.65;

/// Main error type for butterfly-osm accessibility runs
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or out-of-range setup value, including cache key bound violations
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A segment, district, occupation or zone code that was never registered
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// The utility evaluator failed for a zone
    #[error("Computation failed for zone {zone}: {message}")]
    Computation { zone: u32, message: String },

    /// A remote task, node or the transport itself failed
    #[error("Distribution error: {0}")]
    Distribution(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed input data (zone files, persisted tables)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Build a lookup error for an unknown name, appending a suggestion when one
    /// of the known names is close enough.
    pub fn unknown_name<S: AsRef<str>>(kind: &str, name: &str, known: &[S]) -> Self {
        match suggest_name(name, known) {
            Some(candidate) => Error::Lookup(format!(
                "unknown {kind} '{name}' (did you mean '{candidate}'?)"
            )),
            None => Error::Lookup(format!("unknown {kind} '{name}'")),
        }
    }

    /// True for failures raised by the evaluator itself rather than the plumbing
    pub fn is_computation(&self) -> bool {
        matches!(self, Error::Computation { .. })
    }
}

/// Suggest the closest known name using character-based similarity
///
/// Jaro-Winkler (70%) catches transpositions and shared prefixes, normalized
/// Levenshtein (30%) catches insertions and deletions. Exact case-insensitive
/// matches return `None` because no correction is needed.
pub fn suggest_name<S: AsRef<str>>(input: &str, known: &[S]) -> Option<String> {
    let input_lower = input.to_lowercase();
    let mut best: Option<(&str, f64)> = None;

    for candidate in known {
        let candidate = candidate.as_ref();
        let candidate_lower = candidate.to_lowercase();
        if candidate_lower == input_lower {
            return None;
        }

        let jw = jaro_winkler(&input_lower, &candidate_lower);
        let lev = normalized_levenshtein(&input_lower, &candidate_lower);
        let mut score = jw * 0.7 + lev * 0.3;

        // Segment names share a label prefix and differ in the code suffix
        // ("k-8_12" vs "unified k-8_12"); reward an identical suffix.
        if let (Some(a), Some(b)) = (input_lower.rsplit_once('_'), candidate_lower.rsplit_once('_')) {
            if a.1 == b.1 {
                score += 0.1;
            }
        }

        if score >= MIN_SUGGESTION_SCORE && best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }

    best.map(|(name, _)| name.to_string())
}

/// Convenience result type for butterfly-osm accessibility operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_name_typo() {
        let known = ["preschool", "k-8_5", "9-12_5", "univ typical"];
        assert_eq!(suggest_name("preschol", &known), Some("preschool".to_string()));
        assert_eq!(suggest_name("univ typcal", &known), Some("univ typical".to_string()));
    }

    #[test]
    fn test_suggest_name_exact_match_needs_no_correction() {
        let known = ["Management", "Professional"];
        assert_eq!(suggest_name("management", &known), None);
    }

    #[test]
    fn test_suggest_name_unrelated_input() {
        let known = ["preschool", "univ typical"];
        assert_eq!(suggest_name("zzzzzzzzzzzz", &known), None);
    }

    #[test]
    fn test_unknown_name_message() {
        let known = ["preschool", "k-8_5"];
        let err = Error::unknown_name("segment", "preschoool", &known);
        let msg = err.to_string();
        assert!(msg.starts_with("Lookup error: unknown segment 'preschoool'"));
        assert!(msg.contains("did you mean 'preschool'"));
    }

    #[test]
    fn test_computation_display() {
        let err = Error::Computation {
            zone: 42,
            message: "division by zero".to_string(),
        };
        assert_eq!(err.to_string(), "Computation failed for zone 42: division by zero");
        assert!(err.is_computation());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::IoError(_)));
    }
}
