//! Interpreting response headers.

use std::sync::OnceLock;

use regex::Regex;

use super::Headers;
use crate::breakpoint::CHUNKED_CONTENT_LENGTH;

fn content_range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bytes (\d+)-(\d+)/\d+").expect("valid content-range regex"))
}

fn quoted_disposition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"attachment;\s*filename\s*=\s*"([^"]*)""#).expect("valid disposition regex")
    })
}

fn bare_disposition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"attachment;\s*filename\s*=\s*(.*)").expect("valid disposition regex")
    })
}

/// Parses a `Content-Length` value; unparsable values mean chunked.
pub fn parse_content_length(value: &str) -> u64 {
    value
        .trim()
        .parse::<u64>()
        .unwrap_or(CHUNKED_CONTENT_LENGTH)
}

/// Length covered by a `Content-Range: bytes start-end/total` value.
pub fn parse_content_range_length(value: &str) -> Option<u64> {
    let captures = content_range_regex().captures(value)?;
    let start: u64 = captures.get(1)?.as_str().parse().ok()?;
    let end: u64 = captures.get(2)?.as_str().parse().ok()?;
    end.checked_sub(start).map(|span| span + 1)
}

/// Body length of a response, or [`CHUNKED_CONTENT_LENGTH`] when unknown.
pub fn response_content_length(headers: &Headers) -> u64 {
    match headers.get("Content-Length").filter(|v| !v.trim().is_empty()) {
        Some(value) => parse_content_length(value),
        None => headers
            .get("Content-Range")
            .and_then(parse_content_range_length)
            .unwrap_or(CHUNKED_CONTENT_LENGTH),
    }
}

/// Whether the server honours byte ranges.
pub fn is_accept_range(status: u16, headers: &Headers) -> bool {
    status == 206
        || headers
            .get("Accept-Ranges")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"))
}

/// Filename from a `Content-Disposition: attachment; filename=...` value.
pub fn content_disposition_filename(value: &str) -> Option<String> {
    let name = quoted_disposition_regex()
        .captures(value)
        .or_else(|| bare_disposition_regex().captures(value))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().trim_end_matches(';').trim().to_string())?;

    // A server-chosen name must not escape the target directory.
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default().to_string();
    (!name.is_empty() && name != "." && name != "..").then_some(name)
}
