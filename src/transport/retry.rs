//! Fixed-delay retry of transient transport failures.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use super::{Request, Response, Transport};
use crate::error::{Error, Result};

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` attempts spaced by `delay`.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Returns true if another attempt is allowed after `attempt` failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Wraps a transport and retries [`Error::TransientNetwork`] failures of
/// retryable requests.
///
/// Every other outcome, including non-2xx responses and transient failures of
/// non-retryable requests, is returned unchanged.
/// Downloads are not retried: a partially written sink cannot be rewound.
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Transport> Retrying<T> {
    /// Wraps `inner` with the given policy.
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Returns the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for Retrying<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        if !request.retryable {
            return self.inner.send(request).await;
        }
        let mut attempt = 1;
        loop {
            match self.inner.send(request.clone()).await {
                Err(Error::TransientNetwork { reason, .. }) => {
                    if !self.policy.allows_retry(attempt) {
                        tracing::warn!(
                            method = %request.method,
                            url = %request.url,
                            attempts = attempt,
                            "giving up after transient failures"
                        );
                        return Err(Error::RetriesExhausted {
                            method: request.method,
                            url: request.url.clone(),
                            attempts: attempt,
                            reason,
                        });
                    }
                    tracing::warn!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        reason = %reason,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn download(
        &self,
        request: Request,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.inner.download(request, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Body, Method, ScriptedTransport};

    const URL: &str = "http://ci/api/json";

    #[test]
    fn policy_defaults_to_five_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[test]
    fn policy_always_allows_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let scripted = ScriptedTransport::new();
        scripted.fail_transient(Method::Get, URL, "connection reset by peer");
        scripted.fail_transient(Method::Get, URL, "connection reset by peer");
        scripted.on(Method::Get, URL, Response::new(200).with_body("{}"));

        let transport = Retrying::new(scripted, RetryPolicy::default());
        let response = transport.send(Request::get(URL)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.inner().count(Method::Get, URL), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let scripted = ScriptedTransport::new();
        scripted.fail_transient(Method::Get, URL, "connection reset by peer");

        let transport = Retrying::new(scripted, RetryPolicy::new(3, Duration::from_secs(1)));
        let err = transport.send(Request::get(URL)).await.unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(transport.inner().count(Method::Get, URL), 3);
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let scripted = ScriptedTransport::new();
        scripted.on(Method::Get, URL, Response::new(500));

        let transport = Retrying::new(scripted, RetryPolicy::default());
        let response = transport.send(Request::get(URL)).await.unwrap();

        assert_eq!(response.status, 500);
        assert_eq!(transport.inner().count(Method::Get, URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_are_sent_once() {
        const SUBMIT: &str = "http://ci/job/app/build";
        let scripted = ScriptedTransport::new();
        scripted.fail_transient(Method::Post, SUBMIT, "connection reset by peer");
        scripted.on(Method::Post, SUBMIT, Response::new(201));

        let transport = Retrying::new(scripted, RetryPolicy::default());
        let err = transport
            .send(Request::post(SUBMIT, Body::Empty))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransientNetwork { .. }));
        assert_eq!(transport.inner().count(Method::Post, SUBMIT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_posts_are_retried() {
        const CONSOLE: &str = "http://ci/job/app/1/logText/progressiveText";
        let scripted = ScriptedTransport::new();
        scripted.fail_transient(Method::Post, CONSOLE, "connection reset by peer");
        scripted.on(Method::Post, CONSOLE, Response::new(200));

        let transport = Retrying::new(scripted, RetryPolicy::default());
        let request = Request::post(CONSOLE, Body::Empty).idempotent();
        let response = transport.send(request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.inner().count(Method::Post, CONSOLE), 2);
    }
}
