//! `reqwest`-backed transport with TLS version fallback.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Body, Method, Request, Response, Transport};
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("jenkins-mirror/", env!("CARGO_PKG_VERSION"));

/// Artifact bodies are written to disk in blocks of this size.
const BLOCK_SIZE: usize = 8192;

/// Transport talking to a real Jenkins server.
///
/// Holds two connection pools: the default one negotiates the TLS version
/// freely, the fallback one is capped at TLS 1.2 for servers that fail the
/// handshake otherwise. After the first negotiation failure the session stays
/// on the fallback pool.
pub struct HttpTransport {
    client: reqwest::Client,
    fallback: reqwest::Client,
    downgraded: AtomicBool,
}

impl HttpTransport {
    /// Creates a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = Self::client_builder(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        let fallback = Self::client_builder(connect_timeout)
            .max_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .map_err(|e| Error::Config(format!("failed to build TLS 1.2 HTTP client: {}", e)))?;

        Ok(Self {
            client,
            fallback,
            downgraded: AtomicBool::new(false),
        })
    }

    /// Returns true once the session fell back to TLS 1.2.
    pub fn is_downgraded(&self) -> bool {
        self.downgraded.load(Ordering::Relaxed)
    }

    fn client_builder(connect_timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
    }

    fn prepare(client: &reqwest::Client, request: &Request) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };

        if let Some(token) = &request.credentials.token {
            builder = builder.query(&[("token", token)]);
        }
        if let Some(username) = &request.credentials.username {
            builder = builder.basic_auth(username, request.credentials.password.as_ref());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        match &request.body {
            Body::Empty => builder,
            Body::Form(fields) => builder.form(fields),
            Body::Multipart { fields, files } => {
                let mut form = multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
                for file in files {
                    let part =
                        multipart::Part::bytes(file.content.clone()).file_name(file.file_name.clone());
                    form = form.part(file.field.clone(), part);
                }
                builder.multipart(form)
            }
        }
    }

    async fn execute(&self, request: &Request) -> Result<reqwest::Response> {
        let downgraded = self.is_downgraded();
        let client = if downgraded { &self.fallback } else { &self.client };

        tracing::debug!(method = %request.method, url = %request.url, "sending request");

        match Self::prepare(client, request).send().await {
            Ok(response) => Ok(response),
            Err(err) if !downgraded && is_tls_negotiation_failure(&err) => {
                tracing::warn!(
                    url = %request.url,
                    error = %err.without_url(),
                    "TLS negotiation failed, falling back to TLS 1.2"
                );
                self.downgraded.store(true, Ordering::Relaxed);
                Self::prepare(&self.fallback, request)
                    .send()
                    .await
                    .map_err(|e| classify(request, e))
            }
            Err(err) => Err(classify(request, err)),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let response = self.execute(&request).await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify(&request, e))?
            .to_vec();

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            "response received"
        );

        Ok(Response {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }

    async fn download(
        &self,
        request: Request,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let mut response = self.execute(&request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteRequestFailed {
                method: request.method,
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                url: request.url.clone(),
            });
        }

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(&request, e))? {
            for block in chunk.chunks(BLOCK_SIZE) {
                sink.write_all(block).await?;
                written += block.len() as u64;
            }
        }
        Ok(written)
    }
}

/// Maps a `reqwest` failure onto the error taxonomy.
///
/// The URL is stripped from the message since it may carry the token.
fn classify(request: &Request, err: reqwest::Error) -> Error {
    let transient = is_transient(&err);
    let reason = err.without_url().to_string();
    if transient {
        Error::TransientNetwork {
            url: request.url.clone(),
            reason,
        }
    } else {
        Error::Transport {
            method: request.method,
            url: request.url.clone(),
            reason,
        }
    }
}

/// Connection torn down mid-exchange, typically during TLS teardown.
fn is_transient(err: &reqwest::Error) -> bool {
    error_chain(err).any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::UnexpectedEof
                )
            })
    })
}

fn is_tls_negotiation_failure(err: &reqwest::Error) -> bool {
    if !err.is_connect() {
        return false;
    }
    error_chain(err).any(|cause| {
        let message = cause.to_string().to_ascii_lowercase();
        message.contains("protocolversion")
            || message.contains("protocol version")
            || message.contains("peer is incompatible")
            || message.contains("peerincompatible")
            || message.contains("handshake")
    })
}

fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |cause: &&'a (dyn StdError + 'static)| (*cause).source())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_both_clients() {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        assert!(!transport.is_downgraded());
    }

    #[test]
    fn prepare_puts_token_in_query() {
        let client = reqwest::Client::new();
        let request = Request::get("http://ci/job/app/api/json")
            .with_credentials(crate::auth::Credentials::token("abc"));

        let built = HttpTransport::prepare(&client, &request).build().unwrap();

        assert_eq!(built.url().query(), Some("token=abc"));
    }

    #[test]
    fn prepare_uses_basic_auth() {
        let client = reqwest::Client::new();
        let request = Request::get("http://ci/api/json")
            .with_credentials(crate::auth::Credentials::basic("alice", "secret123"));

        let built = HttpTransport::prepare(&client, &request).build().unwrap();
        let header = built.headers().get("authorization").unwrap();

        // base64("alice:secret123")
        assert_eq!(header.to_str().unwrap(), "Basic YWxpY2U6c2VjcmV0MTIz");
    }

    #[test]
    fn prepare_encodes_form_bodies() {
        let client = reqwest::Client::new();
        let request = Request::post(
            "http://ci/job/app/1/logText/progressiveText",
            Body::Form(vec![("start".to_string(), "128".to_string())]),
        );

        let built = HttpTransport::prepare(&client, &request).build().unwrap();
        let body = built.body().and_then(|b| b.as_bytes()).unwrap();

        assert_eq!(body, b"start=128");
    }

    #[test]
    fn io_chain_detects_connection_reset() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let found = error_chain(&io).any(|cause| cause.downcast_ref::<std::io::Error>().is_some());
        assert!(found);
    }
}
