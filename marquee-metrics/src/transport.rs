//! HTTP delivery of encoded payloads.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue};
use thiserror::Error;
use tracing::trace;

use crate::config::Credentials;
use crate::encoder::EncodedPayload;

/// Longest response body excerpt kept in a [`TransportError::Status`].
pub const MAX_BODY_SNIPPET: usize = 512;

const REMOTE_WRITE_VERSION: &str = "x-prometheus-remote-write-version";

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Request to {url} timed out")]
    Timeout { url: String },
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
}

impl TransportError {
    /// HTTP status code, for non-2xx responses.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Delivers one payload per call.
///
/// Implementations must not retry; the caller decides what happens after a
/// failure.
pub trait Transport: Send + Sync + 'static {
    /// Send a payload, returning once the remote end has answered.
    fn push(
        &self,
        payload: EncodedPayload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Where payloads are sent, for logs.
    fn target(&self) -> &str;
}

impl<T: Transport> Transport for Arc<T> {
    fn push(
        &self,
        payload: EncodedPayload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).push(payload)
    }

    fn target(&self) -> &str {
        (**self).target()
    }
}

/// Remote-write transport over HTTP POST with optional Basic auth.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    credentials: Option<Credentials>,
}

impl HttpTransport {
    /// Create a transport posting to `url` with the given request timeout.
    pub fn new(
        url: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(REMOTE_WRITE_VERSION, HeaderValue::from_static("0.1.0"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("marquee/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self {
            client,
            url: url.into(),
            credentials,
        })
    }

    fn request_error(&self, source: reqwest::Error) -> TransportError {
        if source.is_timeout() {
            TransportError::Timeout {
                url: self.url.clone(),
            }
        } else {
            TransportError::Request {
                url: self.url.clone(),
                source,
            }
        }
    }
}

impl Transport for HttpTransport {
    async fn push(&self, payload: EncodedPayload) -> Result<(), TransportError> {
        trace!(
            url = %self.url,
            bytes = payload.body.len(),
            series = payload.series_count,
            "Sending remote-write request"
        );

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, payload.content_type)
            .header(CONTENT_ENCODING, payload.content_encoding)
            .body(payload.body);

        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = match response.text().await {
            Ok(body) => truncate_body(&body, MAX_BODY_SNIPPET),
            Err(e) => format!("<unreadable body: {}>", e),
        };

        Err(TransportError::Status {
            url: self.url.clone(),
            status: status.as_u16(),
            body,
        })
    }

    fn target(&self) -> &str {
        &self.url
    }
}

/// Cut `body` to at most `max` bytes on a char boundary.
pub fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
