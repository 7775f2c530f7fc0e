#![forbid(unsafe_code)]

//! Guards applied before anything user supplied reaches the fetcher's command
//! line, plus the startup privilege check.

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::FetchError;

/// Fails fast when the server is started as root. The fetcher runs on
/// arbitrary user-supplied URLs and should never inherit root privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Accepts only absolute http(s) URLs without whitespace or control
/// characters. Anything else could be read by the fetcher as an option or a
/// local path.
pub fn validate_source_url(url: &str) -> Result<(), FetchError> {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .ok_or_else(|| FetchError::Validation("URL must start with http:// or https://".into()))?;
    if rest.is_empty() {
        return Err(FetchError::Validation("URL has no host".into()));
    }
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(FetchError::Validation(
            "URL must not contain whitespace or control characters".into(),
        ));
    }
    Ok(())
}

/// Format ids are fetcher selector expressions such as `18`, `251` or
/// `137+140`. They never begin with a dash and only use a small alphabet.
pub fn validate_format_id(format_id: &str) -> Result<(), FetchError> {
    if format_id.is_empty() {
        return Err(FetchError::Validation("format id is empty".into()));
    }
    if format_id.starts_with('-') {
        return Err(FetchError::Validation(
            "format id must not start with '-'".into(),
        ));
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric()
            || matches!(
                c,
                '+' | '/' | '_' | '-' | '.' | '[' | ']' | '<' | '>' | '=' | '*' | '!' | '?' | ':'
                    | ','
            )
    };
    if !format_id.chars().all(allowed) {
        return Err(FetchError::Validation(format!(
            "format id contains unsupported characters: {format_id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn source_url_accepts_http_and_https() {
        assert!(validate_source_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(validate_source_url("HTTP://example.com/video").is_ok());
    }

    #[test]
    fn source_url_rejects_options_and_paths() {
        for candidate in [
            "--exec=rm -rf /",
            "/etc/passwd",
            "file:///etc/passwd",
            "https://",
            "https://example.com/a b",
            "https://example.com/\nx",
        ] {
            let err = validate_source_url(candidate).unwrap_err();
            assert!(matches!(err, FetchError::Validation(_)), "{candidate}");
        }
    }

    #[test]
    fn format_id_accepts_selector_expressions() {
        for candidate in ["18", "251", "137+140", "bv*+ba/b", "best[height<=720]", "hls-1080p"] {
            assert!(validate_format_id(candidate).is_ok(), "{candidate}");
        }
    }

    #[test]
    fn format_id_rejects_option_like_values() {
        assert!(validate_format_id("").is_err());
        assert!(validate_format_id("--exec").is_err());
        assert!(validate_format_id("18 --exec").is_err());
        assert!(validate_format_id("18;ls").is_err());
    }
}
