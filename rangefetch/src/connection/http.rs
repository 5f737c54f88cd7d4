//! Connections backed by reqwest's blocking client.

use std::io::{self, Read};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::redirect;
use tracing::trace;

use super::{Connected, Connection, ConnectionFactory, Headers};
use crate::error::{DownloadError, DownloadResult};

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single body read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Client settings for [`HttpConnectionFactory`].
#[derive(Clone, Debug)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            user_agent: concat!("rangefetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Creates [`Connection`]s sharing one pooled reqwest client.
///
/// Redirects are not followed by the client; the engine handles them so it
/// can remember the final location for the other blocks.
#[derive(Clone, Debug)]
pub struct HttpConnectionFactory {
    client: Client,
}

impl HttpConnectionFactory {
    pub fn new(settings: &HttpSettings) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| DownloadError::Http {
                url: String::new(),
                source: e,
            })?;
        Ok(Self { client })
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self, url: &str) -> DownloadResult<Box<dyn Connection>> {
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            url: url.to_string(),
            headers: Headers::new(),
        }))
    }
}

struct HttpConnection {
    client: Client,
    url: String,
    headers: Headers,
}

impl Connection for HttpConnection {
    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value);
    }

    fn request_headers(&self) -> &Headers {
        &self.headers
    }

    fn execute(&mut self) -> DownloadResult<Box<dyn Connected>> {
        let mut request = self.client.get(&self.url);
        for (name, value) in self.headers.iter() {
            request = request.header(name, value);
        }

        trace!(url = %self.url, headers = self.headers.len(), "Sending request");
        let response = request.send().map_err(|e| DownloadError::Http {
            url: self.url.clone(),
            source: e,
        })?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Box::new(HttpConnected {
            status: response.status().as_u16(),
            headers,
            response,
        }))
    }
}

struct HttpConnected {
    status: u16,
    headers: Headers,
    response: Response,
}

impl Connected for HttpConnected {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}
