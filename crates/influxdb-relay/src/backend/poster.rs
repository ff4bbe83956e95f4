//! Single-shot HTTP posting to a backend location.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use reqwest::Url;
use std::time::Duration;

use crate::error::RelayError;

/// Response from a backend post.
///
/// Header names are lowercase by construction. HTTP-level error statuses are
/// carried here rather than surfaced as errors; interpreting the status is
/// the caller's job.
#[derive(Debug, Clone)]
pub struct PostResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PostResponse {
    /// The synthetic response handed back by buffered admission.
    pub(crate) fn accepted() -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Sends one body to one backend location.
#[async_trait]
pub trait Poster: Send + Sync {
    /// Post `body` with the raw query string copied verbatim and the
    /// `Authorization` header forwarded when present.
    ///
    /// Returns `Err` only for transport failures (connect, timeout, TLS).
    async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> Result<PostResponse, RelayError>;
}

/// Direct poster: one synchronous POST per call, no buffering or retry.
#[derive(Debug)]
pub struct SimplePoster {
    client: reqwest::Client,
    location: Url,
}

impl SimplePoster {
    /// Create a poster for a fixed location.
    ///
    /// The client enforces `timeout` over the whole request and optionally
    /// accepts invalid certificates for backends with self-signed certs.
    pub fn new(
        location: &str,
        timeout: Duration,
        skip_tls_verification: bool,
    ) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verification)
            .build()?;

        let location = Url::parse(location)
            .map_err(|e| RelayError::InvalidBackendUrl(format!("{location}: {e}")))?;

        Ok(Self { client, location })
    }
}

#[async_trait]
impl Poster for SimplePoster {
    async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> Result<PostResponse, RelayError> {
        let mut url = self.location.clone();
        url.set_query((!query.is_empty()).then_some(query));

        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body);

        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }

        let response = request.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(PostResponse {
            status,
            headers,
            body,
        })
    }
}
