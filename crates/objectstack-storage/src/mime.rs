//! Content-type validation and metadata normalization.

use objectstack_core::{StorageError, StorageResult};

/// Validate a content type against a bucket's allow list.
///
/// Patterns are `*/*` (anything), `type/*` (any subtype), or an exact
/// type. Parameters (`; charset=...`) on the candidate are ignored. An
/// empty or absent allow list accepts everything.
///
/// # Errors
///
/// [`StorageError::InvalidMimeType`] when the candidate is malformed or
/// matches no pattern.
pub fn validate_mime_type(content_type: &str, allowed: Option<&[String]>) -> StorageResult<()> {
    let parsed: mime::Mime =
        content_type
            .parse()
            .map_err(|_| StorageError::InvalidMimeType {
                mime_type: content_type.to_owned(),
            })?;
    let essence = parsed.essence_str();

    let Some(patterns) = allowed else {
        return Ok(());
    };
    if patterns.is_empty() {
        return Ok(());
    }

    for pattern in patterns {
        if pattern == "*/*" {
            return Ok(());
        }
        if let Some(kind) = pattern.strip_suffix("/*") {
            if essence
                .split('/')
                .next()
                .is_some_and(|t| t.eq_ignore_ascii_case(kind))
            {
                return Ok(());
            }
        } else if pattern.eq_ignore_ascii_case(essence) {
            return Ok(());
        }
    }

    Err(StorageError::InvalidMimeType {
        mime_type: content_type.to_owned(),
    })
}

/// Normalize caller-provided cache-control metadata.
///
/// An integer is interpreted as a max-age in seconds; anything else
/// becomes `no-cache`.
#[must_use]
pub fn normalize_cache_control(value: Option<&str>) -> String {
    match value.and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(seconds) => format!("max-age={seconds}"),
        None => "no-cache".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_accept_anything_without_allow_list() {
        assert!(validate_mime_type("image/png", None).is_ok());
        assert!(validate_mime_type("image/png", Some(&[])).is_ok());
    }

    #[test]
    fn test_should_match_wildcard_patterns() {
        let patterns = vec!["image/*".to_owned(), "application/json".to_owned()];
        assert!(validate_mime_type("image/png", Some(&patterns)).is_ok());
        assert!(validate_mime_type("image/jpeg; quality=85", Some(&patterns)).is_ok());
        assert!(validate_mime_type("application/json", Some(&patterns)).is_ok());
        assert!(validate_mime_type("text/plain", Some(&patterns)).is_err());
    }

    #[test]
    fn test_should_match_catch_all_pattern() {
        let patterns = vec!["*/*".to_owned()];
        assert!(validate_mime_type("application/x-anything", Some(&patterns)).is_ok());
    }

    #[test]
    fn test_should_reject_malformed_content_type() {
        let patterns = vec!["*/*".to_owned()];
        let result = validate_mime_type("not a mime", Some(&patterns));
        assert!(matches!(
            result,
            Err(StorageError::InvalidMimeType { .. })
        ));
    }

    #[test]
    fn test_should_normalize_cache_control() {
        assert_eq!(normalize_cache_control(Some("3600")), "max-age=3600");
        assert_eq!(normalize_cache_control(Some(" 60 ")), "max-age=60");
        assert_eq!(normalize_cache_control(Some("private")), "no-cache");
        assert_eq!(normalize_cache_control(None), "no-cache");
    }
}
