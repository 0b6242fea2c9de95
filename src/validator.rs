//! Stateless batch validation.
//!
//! Every check runs before anything touches the store. The first violation
//! encountered is returned; a batch is either entirely valid or rejected.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::types::Dimension;

pub const MIN_BATCH_SIZE: usize = 3;
pub const MAX_BATCH_SIZE: usize = 6;
pub const MIN_CONTENT_CHARS: usize = 50;
pub const MAX_CONTENT_CHARS: usize = 5000;

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]{1,32}$").expect("valid handle regex"));

/// One item of a batch as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentInput {
    pub dimension: String,
    pub content: String,
}

/// Batch submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub handle: String,
    pub fragments: Vec<FragmentInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedFragment {
    pub dimension: Dimension,
    pub content: String,
}

/// A batch that passed every check. Dimensions are pairwise distinct.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub handle: String,
    pub fragments: Vec<ValidatedFragment>,
}

/// Normalise a soul handle: strip a leading `@`, trim, lower-case.
pub fn normalize_handle(raw: &str) -> Result<String, ValidationError> {
    let handle = raw.trim().trim_start_matches('@').to_lowercase();
    if handle.is_empty() {
        return Err(ValidationError::InvalidShape("handle is required".into()));
    }
    if !HANDLE_RE.is_match(&handle) {
        return Err(ValidationError::field(
            "handle",
            "must be 1-32 characters of a-z, 0-9 or underscore",
        ));
    }
    Ok(handle)
}

/// Validate a batch submission.
pub fn validate_batch(request: &BatchRequest) -> Result<ValidatedBatch, ValidationError> {
    let handle = normalize_handle(&request.handle)?;

    let got = request.fragments.len();
    if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&got) {
        return Err(ValidationError::BatchSize {
            got,
            min: MIN_BATCH_SIZE,
            max: MAX_BATCH_SIZE,
        });
    }

    let mut seen = HashSet::with_capacity(got);
    let mut fragments = Vec::with_capacity(got);

    for item in &request.fragments {
        let dimension: Dimension = item
            .dimension
            .trim()
            .parse()
            .map_err(|_| ValidationError::UnknownDimension(item.dimension.clone()))?;

        if !seen.insert(dimension) {
            return Err(ValidationError::DuplicateDimension(dimension));
        }

        let content = item.content.trim();
        let length = content.chars().count();
        if !(MIN_CONTENT_CHARS..=MAX_CONTENT_CHARS).contains(&length) {
            return Err(ValidationError::ContentLength {
                dimension,
                length,
                min: MIN_CONTENT_CHARS,
                max: MAX_CONTENT_CHARS,
            });
        }

        fragments.push(ValidatedFragment {
            dimension,
            content: content.to_string(),
        });
    }

    Ok(ValidatedBatch { handle, fragments })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(dimension: &str) -> FragmentInput {
        FragmentInput {
            dimension: dimension.to_string(),
            content: format!("A sufficiently long observation about the {} of this figure.", dimension),
        }
    }

    fn batch(dimensions: &[&str]) -> BatchRequest {
        BatchRequest {
            handle: "@Satoshi".to_string(),
            fragments: dimensions.iter().map(|d| item(d)).collect(),
        }
    }

    #[test]
    fn test_valid_batch_preserves_count_and_order() {
        let validated = validate_batch(&batch(&["personality", "stance", "style"])).unwrap();
        assert_eq!(validated.handle, "satoshi");
        assert_eq!(validated.fragments.len(), 3);
        assert_eq!(validated.fragments[0].dimension, Dimension::Personality);
        assert_eq!(validated.fragments[2].dimension, Dimension::Style);
    }

    #[test]
    fn test_batch_size_bounds() {
        let two = validate_batch(&batch(&["personality", "stance"])).unwrap_err();
        assert_eq!(two, ValidationError::BatchSize { got: 2, min: 3, max: 6 });

        let mut seven = batch(&[
            "personality",
            "knowledge",
            "stance",
            "style",
            "relationship",
            "timeline",
        ]);
        seven.fragments.push(item("personality"));
        let err = validate_batch(&seven).unwrap_err();
        assert!(matches!(err, ValidationError::BatchSize { got: 7, .. }));

        let six = batch(&[
            "personality",
            "knowledge",
            "stance",
            "style",
            "relationship",
            "timeline",
        ]);
        assert!(validate_batch(&six).is_ok());
    }

    #[test]
    fn test_unknown_dimension() {
        let err = validate_batch(&batch(&["personality", "aura", "style"])).unwrap_err();
        assert_eq!(err, ValidationError::UnknownDimension("aura".into()));
    }

    #[test]
    fn test_duplicate_dimension() {
        let err = validate_batch(&batch(&["style", "stance", "style"])).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateDimension(Dimension::Style));
    }

    #[test]
    fn test_first_violation_wins() {
        // Unknown dimension at index 1 is reported before the duplicate at index 2.
        let err = validate_batch(&batch(&["style", "aura", "style"])).unwrap_err();
        assert_eq!(err.code(), "unknown_dimension");
    }

    #[test]
    fn test_content_length_bounds() {
        let mut request = batch(&["personality", "stance", "style"]);
        request.fragments[1].content = "too short".into();
        let err = validate_batch(&request).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ContentLength { dimension: Dimension::Stance, length: 9, .. }
        ));

        request.fragments[1].content = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(validate_batch(&request).is_err());

        request.fragments[1].content = "x".repeat(MAX_CONTENT_CHARS);
        assert!(validate_batch(&request).is_ok());
    }

    #[test]
    fn test_content_length_counts_characters_not_bytes() {
        let mut request = batch(&["personality", "stance", "style"]);
        // 50 multi-byte characters.
        request.fragments[0].content = "é".repeat(MIN_CONTENT_CHARS);
        assert!(validate_batch(&request).is_ok());
    }

    #[test]
    fn test_handle_rules() {
        assert_eq!(normalize_handle("  @Vitalik_B ").unwrap(), "vitalik_b");
        assert_eq!(normalize_handle("").unwrap_err().code(), "invalid_shape");
        assert_eq!(normalize_handle("bad handle").unwrap_err().code(), "invalid_field");
    }
}
