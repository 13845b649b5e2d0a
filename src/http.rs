//! The HTTP collaborator.
//!
//! The engine talks to the target through the [`HttpClient`] trait so that
//! tests can substitute an in-memory client. [`ReqwestClient`] is the real
//! implementation. Every virtual user owns its own client instance, created
//! by a [`ClientFactory`], and with it its own connection pool.

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HttpError;

/// A request to issue against the target.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Per-request timeout; the client's default applies when `None`.
    pub timeout: Option<Duration>,
    /// Value of the `name` tag on this request's samples. Defaults to the URL.
    pub name: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            name: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add an `Authorization: Bearer <token>` header.
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set `Content-Type`.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(body))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The `name` tag value for this request's samples.
    pub fn tag_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Where the time of a request went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// From sending the request until the response headers arrived.
    pub waiting: Duration,
    /// Reading the response body.
    pub receiving: Duration,
    /// Total time of the request.
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timings: Timings,
}

impl HttpResponse {
    /// First header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Statuses outside `200..400` count as failed requests.
    pub fn is_failure(&self) -> bool {
        !(200..400).contains(&self.status)
    }
}

/// Issues HTTP requests for one virtual user.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;

    /// Issue every request concurrently and wait for all of them. Results
    /// come back in request order; each request is bounded by its own
    /// timeout, so a slow request yields `Err(HttpError::Timeout)` rather
    /// than holding up the others indefinitely.
    async fn batch(&self, requests: Vec<HttpRequest>) -> Vec<Result<HttpResponse, HttpError>> {
        futures::future::join_all(requests.into_iter().map(|r| self.request(r))).await
    }
}

/// Creates the client for the VU with the given id.
pub type ClientFactory = Arc<dyn Fn(u64) -> Arc<dyn HttpClient> + Send + Sync>;

/// [`HttpClient`] backed by `reqwest`.
#[cfg(feature = "http-client")]
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    timeout: Duration,
}

#[cfg(feature = "http-client")]
impl ReqwestClient {
    /// Default per-request timeout, matching k6.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// A factory giving every VU its own client and connection pool.
    pub fn factory(timeout: Duration) -> ClientFactory {
        Arc::new(move |_vu_id| Arc::new(ReqwestClient::new(timeout)) as Arc<dyn HttpClient>)
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout.unwrap_or(self.timeout));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let start = tokio::time::Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| HttpError::classify_reqwest(&e))?;
        let waiting = start.elapsed();

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::classify_reqwest(&e))?;
        let duration = start.elapsed();

        Ok(HttpResponse {
            status,
            headers,
            body,
            timings: Timings {
                waiting,
                receiving: duration.saturating_sub(waiting),
                duration,
            },
        })
    }
}
