//! Download filenames derived from user-supplied titles.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

pub const MAX_FILENAME_CHARS: usize = 200;
pub const FALLBACK_FILENAME: &str = "download";

/// Everything except RFC 3986 unreserved characters gets percent-encoded.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Makes a title safe for file systems and HTTP header values.
///
/// Characters reserved on common file systems become `_`, C0/C1 control
/// characters are dropped, the result is capped at [`MAX_FILENAME_CHARS`]
/// characters and stripped of surrounding spaces and dots. An empty result
/// falls back to [`FALLBACK_FILENAME`]. Applying it twice changes nothing.
pub fn sanitize_filename(title: &str) -> String {
    let capped: String = title
        .chars()
        .filter_map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => Some('_'),
            c if is_control(c) => None,
            c => Some(c),
        })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let trimmed = capped.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1f | 0x7f..=0x9f)
}

/// Renders an attachment `Content-Disposition` value. Plain printable ASCII
/// names use the quoted form; anything else uses the RFC 5987 `filename*`
/// form so the header never carries raw non-ASCII bytes.
pub fn content_disposition(filename: &str) -> String {
    let quotable = filename
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\');
    if quotable {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(filename, FILENAME_ENCODE_SET)
        )
    }
}
