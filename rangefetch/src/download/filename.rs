//! Naming a file when the task only gave a directory.

use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::connection::{content_disposition_filename, Headers};

/// Filename for a response: `Content-Disposition`, else the last URL path
/// segment, else the hex SHA-256 of the url.
pub fn resolve_filename(url: &str, headers: &Headers) -> String {
    headers
        .get("Content-Disposition")
        .and_then(content_disposition_filename)
        .or_else(|| url_filename(url))
        .unwrap_or_else(|| format!("{:x}", Sha256::digest(url.as_bytes())))
}

fn url_filename(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .filter(|segment| *segment != "." && *segment != "..")
        .map(str::to_string)
}
