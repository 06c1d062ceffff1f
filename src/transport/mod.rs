//! HTTP transport for the Jenkins remote API.
//!
//! The [`Transport`] trait is the only seam between the mirror and the network.
//! [`HttpTransport`] talks to a real server, [`Retrying`] adds bounded retries of
//! transient failures on top of any transport. With the `test-utils` feature,
//! `ScriptedTransport` serves canned responses for tests.

mod http;
mod retry;
#[cfg(any(test, feature = "test-utils"))]
mod scripted;

pub use http::HttpTransport;
pub use retry::{RetryPolicy, Retrying};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedTransport;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::auth::Credentials;
use crate::error::{Error, Result};

/// HTTP method used against the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Returns the method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file attached to a multipart submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Multipart field name.
    pub field: String,
    /// File name reported to the server.
    pub file_name: String,
    /// File content.
    pub content: Vec<u8>,
}

/// Request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded` fields.
    Form(Vec<(String, String)>),
    /// `multipart/form-data` text fields and files.
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

/// A request against the remote API.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub body: Body,
    pub credentials: Credentials,
    pub timeout: Option<Duration>,
    /// Safe to send again after a transient failure. Build submissions are
    /// not: the server may already have queued them.
    pub retryable: bool,
}

impl Request {
    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            body: Body::Empty,
            credentials: Credentials::none(),
            timeout: None,
            retryable: true,
        }
    }

    /// Creates a POST request with the given body. POSTs are not retried
    /// unless marked [`Request::idempotent`].
    pub fn post(url: impl Into<String>, body: Body) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            body,
            credentials: Credentials::none(),
            timeout: None,
            retryable: false,
        }
    }

    /// Marks the request as safe to repeat.
    pub fn idempotent(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Sets the credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    /// Creates an empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: canonical_reason(status).to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Creates a `200 OK` response carrying a JSON document.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into [`Error::RemoteRequestFailed`].
    pub fn error_for_status(self, method: Method, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::RemoteRequestFailed {
                method,
                status: self.status,
                reason: self.reason,
                url: url.to_string(),
            })
        }
    }
}

/// Reason phrases for the statuses the remote API commonly returns.
pub(crate) fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Transport for the remote API.
///
/// Implementations are shared read-only between all entities of a mirror and
/// must be safe for concurrent use.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and buffers the whole response.
    ///
    /// Non-2xx statuses are returned as responses, not errors.
    async fn send(&self, request: Request) -> Result<Response>;

    /// Streams a successful response body into `sink`, returning the byte count.
    ///
    /// Non-2xx statuses fail with [`Error::RemoteRequestFailed`].
    async fn download(
        &self,
        request: Request,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}
