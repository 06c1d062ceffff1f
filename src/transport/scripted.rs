//! In-memory transport serving scripted responses.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Method, Request, Response, Transport};
use crate::error::{Error, Result};
use crate::locator::join_url;
use crate::lock;

#[derive(Debug, Clone)]
enum Scripted {
    Respond(Response),
    Transient(String),
}

/// Transport answering from a script instead of the network.
///
/// Responses are queued per `(method, url)`. Each request consumes the front
/// of its queue, except that the last scripted answer is repeated forever.
/// Unscripted requests get a `404 Not Found`. Every request is logged.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Scripted>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
    /// Creates a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for `method url`.
    pub fn on(&self, method: Method, url: &str, response: Response) -> &Self {
        self.push(method, url, Scripted::Respond(response))
    }

    /// Queues the JSON document served at `<entity_url>/api/json`.
    pub fn on_json(&self, entity_url: &str, value: serde_json::Value) -> &Self {
        let url = join_url(&[entity_url, "api/json"]);
        self.on(Method::Get, &url, Response::json(&value))
    }

    /// Queues a transient network failure for `method url`.
    pub fn fail_transient(&self, method: Method, url: &str, reason: &str) -> &Self {
        self.push(method, url, Scripted::Transient(reason.to_string()))
    }

    /// Returns all requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    /// Counts requests received for `method url`.
    pub fn count(&self, method: Method, url: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.method == method && request.url == url)
            .count()
    }

    fn push(&self, method: Method, url: &str, answer: Scripted) -> &Self {
        lock(&self.routes)
            .entry((method, url.to_string()))
            .or_default()
            .push_back(answer);
        self
    }

    fn answer(&self, request: &Request) -> Result<Response> {
        lock(&self.requests).push(request.clone());

        let mut routes = lock(&self.routes);
        let Some(queue) = routes.get_mut(&(request.method, request.url.clone())) else {
            return Ok(Response::new(404));
        };
        let answer = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };

        match answer {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Transient(reason)) => Err(Error::TransientNetwork {
                url: request.url.clone(),
                reason,
            }),
            None => Ok(Response::new(404)),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        self.answer(&request)
    }

    async fn download(
        &self,
        request: Request,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let response = self
            .answer(&request)?
            .error_for_status(request.method, &request.url)?;
        sink.write_all(&response.body).await?;
        Ok(response.body.len() as u64)
    }
}
