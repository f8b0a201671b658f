//! Bearer credential parsing and redaction
//!
//! Every stream the agent opens starts with an authorization string of the
//! form `Bearer <token>-<unique_id>`: the pre-shared token identifies the
//! registered agent, the unique id identifies this connect session. Both
//! are alphanumeric, so the first `-` is an unambiguous separator.

use burrow_proto::BEARER_PREFIX;

use crate::error::AdminError;

/// Split an authorization header into (token, unique_id).
pub fn parse_bearer(header: &str) -> Result<(String, String), AdminError> {
    let rest = header.strip_prefix(BEARER_PREFIX).ok_or_else(|| {
        AdminError::InvalidArgument("invalid authorization header".to_string())
    })?;

    let (token, unique_id) = rest.split_once('-').ok_or_else(|| {
        AdminError::InvalidArgument("invalid authorization header".to_string())
    })?;

    if token.is_empty() || unique_id.is_empty() {
        return Err(AdminError::InvalidArgument(
            "invalid authorization header".to_string(),
        ));
    }

    Ok((token.to_string(), unique_id.to_string()))
}

/// Redacted form of a token, safe for logs.
pub fn redact(token: &str) -> String {
    let visible = token.len().min(4);
    format!("{}...", &token[..visible])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_header() {
        let (token, uid) = parse_bearer("Bearer abc123-session9").unwrap();
        assert_eq!(token, "abc123");
        assert_eq!(uid, "session9");
    }

    #[test]
    fn test_parse_missing_prefix() {
        let err = parse_bearer("abc123-session9").unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_parse_missing_separator() {
        let err = parse_bearer("Bearer abc123session9").unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_parse_empty_parts() {
        assert!(parse_bearer("Bearer -session9").is_err());
        assert!(parse_bearer("Bearer abc123-").is_err());
        assert!(parse_bearer("Bearer ").is_err());
    }

    #[test]
    fn test_redact_keeps_short_prefix_only() {
        assert_eq!(redact("abcdefghij"), "abcd...");
        assert_eq!(redact("ab"), "ab...");
    }
}
