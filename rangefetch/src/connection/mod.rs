//! HTTP connection contract.
//!
//! The engine never talks to an HTTP client directly. A [`ConnectionFactory`]
//! creates one [`Connection`] per request; executing it yields a
//! [`Connected`] view with the status, headers and body. The default
//! implementation is [`HttpConnectionFactory`] on reqwest's blocking client.

mod http;
mod response;

use std::io;

pub use http::{HttpConnectionFactory, HttpSettings};
pub use response::{
    content_disposition_filename, is_accept_range, parse_content_length,
    parse_content_range_length, response_content_length,
};

use crate::error::DownloadResult;

/// Ordered header list with case-insensitive lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A prepared request.
pub trait Connection: Send {
    fn add_header(&mut self, name: &str, value: &str);

    fn request_headers(&self) -> &Headers;

    /// Sends the request and blocks until response headers arrive.
    fn execute(&mut self) -> DownloadResult<Box<dyn Connected>>;

    /// Drops any pooled resources. Called before a connection is replaced.
    fn release(&mut self) {}
}

/// A response whose headers have arrived.
pub trait Connected: Send {
    fn status(&self) -> u16;

    fn headers(&self) -> &Headers;

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    /// Reads body bytes; `Ok(0)` marks the end of the body.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Creates connections for a url.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, url: &str) -> DownloadResult<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "42");
        headers.add("ETag", "\"abc\"");
        assert_eq!(headers.get("content-length"), Some("42"));
        assert_eq!(headers.get("etag"), Some("\"abc\""));
        assert_eq!(headers.get("location"), None);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_headers_from_iter_keeps_order() {
        let headers: Headers = [("A", "1"), ("B", "2"), ("a", "3")].into_iter().collect();
        let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["A", "B", "a"]);
        assert_eq!(headers.get("a"), Some("1"));
    }
}
