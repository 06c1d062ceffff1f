//! Generic poll engine shared by all mirrored entities.
//!
//! A [`Mirror`] caches the JSON document of one remote resource together with
//! its poll timestamps and settings. Entity types embed a `Mirror` and implement
//! [`Resource`], which provides polling, read-through lookups and merging on top
//! of it.
//!
//! Polls of one entity are serialized by a per-mirror async gate, so a slow poll
//! can never overwrite the result of a later one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWrite;
use tokio::sync::MutexGuard as GateGuard;
use tokio::time::Instant;

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::locator::join_url;
use crate::lock;
use crate::registry::{EntityKind, Registry};
use crate::transport::{Body, Method, Request, Response, Transport};

/// Mirrored JSON document of one entity.
pub type Data = Map<String, Value>;

/// Lower bound for the sleep between polls of a waiting loop.
pub const MIN_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// When an entity refreshes its cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollPolicy {
    /// Fetch once, then serve from cache until explicitly polled.
    #[default]
    Once,
    /// Refetch when the cached data is older than the interval. A zero interval
    /// refetches on every access.
    Interval(Duration),
}

impl PollPolicy {
    /// Refetch on every access.
    pub fn always() -> Self {
        PollPolicy::Interval(Duration::ZERO)
    }

    /// Maps the configuration form: absent means once, otherwise seconds.
    pub fn from_secs(secs: Option<u64>) -> Self {
        match secs {
            None => PollPolicy::Once,
            Some(secs) => PollPolicy::Interval(Duration::from_secs(secs)),
        }
    }

    /// Returns the more eager of two policies.
    pub fn tighter(self, other: PollPolicy) -> PollPolicy {
        match (self, other) {
            (PollPolicy::Once, other) => other,
            (this, PollPolicy::Once) => this,
            (PollPolicy::Interval(a), PollPolicy::Interval(b)) => PollPolicy::Interval(a.min(b)),
        }
    }

    fn next_after(&self, polled_at: Instant) -> Option<Instant> {
        match self {
            PollPolicy::Once => None,
            PollPolicy::Interval(interval) => Some(polled_at + *interval),
        }
    }
}

/// Per-entity settings, inherited by children at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub poll_policy: PollPolicy,
    pub credentials: Credentials,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
}

impl Settings {
    /// Folds `newer` into these settings.
    ///
    /// The more eager poll policy and the shorter timeout win; credentials are
    /// merged with [`Credentials::merge`].
    pub fn apply_more_specific(&mut self, newer: &Settings) -> Result<()> {
        let credentials = self.credentials.merge(&newer.credentials)?;
        self.credentials = credentials;
        self.poll_policy = self.poll_policy.tighter(newer.poll_policy);
        self.timeout = match (self.timeout, newer.timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }
}

/// Shared collaborators of every entity in one object graph.
#[derive(Clone)]
pub struct Context {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<Registry>,
}

impl Context {
    /// Creates a context with a fresh registry.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Arc::new(Registry::new()),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct State {
    data: Data,
    last_poll: Option<Instant>,
    next_poll: Option<Instant>,
}

/// Cached state of one remote resource.
pub struct Mirror {
    url: String,
    ctx: Context,
    settings: Mutex<Settings>,
    state: Mutex<State>,
    gate: tokio::sync::Mutex<()>,
}

impl Mirror {
    /// Creates an empty, never polled mirror for `url`.
    pub fn new(ctx: &Context, url: impl Into<String>, settings: Settings) -> Self {
        Self {
            url: url.into(),
            ctx: ctx.clone(),
            settings: Mutex::new(settings),
            state: Mutex::new(State::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Canonical URL of the entity.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }

    pub fn poll_policy(&self) -> PollPolicy {
        lock(&self.settings).poll_policy
    }

    /// Replaces the poll policy, recomputing the next due time.
    pub fn set_poll_policy(&self, policy: PollPolicy) {
        lock(&self.settings).poll_policy = policy;
        let mut state = lock(&self.state);
        state.next_poll = state.last_poll.and_then(|at| policy.next_after(at));
    }

    /// Folds settings requested by a later construction into this entity.
    pub fn apply_more_specific(&self, newer: &Settings) -> Result<()> {
        lock(&self.settings).apply_more_specific(newer)
    }

    pub fn last_poll(&self) -> Option<Instant> {
        lock(&self.state).last_poll
    }

    /// Returns true if an explicit poll at `now` should hit the network.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.poll_policy() == PollPolicy::Once {
            return true;
        }
        match lock(&self.state).next_poll {
            Some(next) => next <= now,
            None => true,
        }
    }

    /// Returns true if a read accessor should poll before answering.
    pub fn needs_auto_poll(&self) -> bool {
        self.poll_policy() != PollPolicy::Once || self.last_poll().is_none()
    }

    /// Replaces the cached data unless it is older than what is cached.
    ///
    /// Returns false when the data was rejected as stale.
    pub fn store(&self, data: Data, polled_at: Instant) -> bool {
        let policy = self.poll_policy();
        let mut state = lock(&self.state);
        if state.last_poll.is_some_and(|last| polled_at < last) {
            tracing::debug!(url = %self.url, "discarding stale data");
            return false;
        }
        state.data = data;
        state.last_poll = Some(polled_at);
        state.next_poll = policy.next_after(polled_at);
        true
    }

    /// Marks the cached data as due for refresh.
    pub fn expire(&self) {
        lock(&self.state).next_poll = None;
    }

    /// Looks up `key` in the cached data without polling.
    pub fn lookup(&self, key: &str) -> Result<Value> {
        lock(&self.state)
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound {
                url: self.url.clone(),
                key: key.to_string(),
            })
    }

    /// Runs `f` against the cached data.
    pub fn with_data<R>(&self, f: impl FnOnce(&Data) -> R) -> R {
        f(&lock(&self.state).data)
    }

    /// Returns a copy of the cached data.
    pub fn snapshot(&self) -> Data {
        lock(&self.state).data.clone()
    }

    /// URL of the JSON document mirrored by this entity.
    pub fn api_url(&self) -> String {
        join_url(&[&self.url, "api/json"])
    }

    /// Builds a request carrying this entity's credentials and timeout.
    pub fn request(&self, method: Method, url: impl Into<String>, body: Body) -> Request {
        let settings = self.settings();
        let request = match method {
            Method::Get => Request::get(url),
            Method::Post => Request::post(url, body),
        };
        request
            .with_credentials(settings.credentials)
            .with_timeout(settings.timeout)
    }

    /// Sends a request, failing on non-2xx statuses.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let method = request.method;
        let url = request.url.clone();
        self.ctx
            .transport
            .send(request)
            .await?
            .error_for_status(method, &url)
    }

    /// POSTs `body` to `url`.
    pub async fn post(&self, url: &str, body: Body) -> Result<Response> {
        self.send(self.request(Method::Post, url, body)).await
    }

    /// Streams the body at `url` into `sink`.
    pub async fn download(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        let request = self.request(Method::Get, url, Body::Empty);
        self.ctx.transport.download(request, sink).await
    }

    /// Fetches the entity's JSON document.
    pub async fn fetch(&self) -> Result<Data> {
        let url = self.api_url();
        let response = self.send(self.request(Method::Get, &url, Body::Empty)).await?;
        match serde_json::from_slice::<Value>(&response.body) {
            Ok(Value::Object(data)) => Ok(data),
            Ok(other) => Err(Error::Decode {
                url,
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(Error::Decode {
                url,
                reason: e.to_string(),
            }),
        }
    }

    async fn enter(&self) -> GateGuard<'_, ()> {
        self.gate.lock().await
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Mirror")
            .field("url", &self.url)
            .field("settings", &*lock(&self.settings))
            .field("last_poll", &state.last_poll)
            .field("next_poll", &state.next_poll)
            .finish()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A mirrored remote entity.
///
/// Implementors supply their [`Mirror`] and optionally react to new data in
/// [`Resource::absorb`], typically by refreshing child collections.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Registry namespace of the entity type.
    const KIND: EntityKind;

    fn mirror(&self) -> &Mirror;

    /// Called after new data has been stored, with the poll gate held.
    async fn absorb(&self, _data: &Data, _polled_at: Instant) -> Result<()> {
        Ok(())
    }

    /// Canonical URL of the entity.
    fn url(&self) -> &str {
        self.mirror().url()
    }

    /// Fetches the entity unless the poll policy says the cache is fresh.
    async fn poll(&self) -> Result<()> {
        let mirror = self.mirror();
        let _gate = mirror.enter().await;
        let now = Instant::now();
        if !mirror.is_due(now) {
            tracing::trace!(url = %mirror.url(), "poll skipped, data still fresh");
            return Ok(());
        }
        let data = mirror.fetch().await?;
        if mirror.store(data.clone(), now) {
            self.absorb(&data, now).await?;
        }
        Ok(())
    }

    /// Applies data obtained elsewhere, e.g. from a parent's listing.
    async fn poll_with(&self, data: Data, polled_at: Instant) -> Result<()> {
        let mirror = self.mirror();
        let _gate = mirror.enter().await;
        if mirror.store(data.clone(), polled_at) {
            self.absorb(&data, polled_at).await?;
        }
        Ok(())
    }

    /// Forces a fetch regardless of the poll policy.
    async fn refresh(&self) -> Result<()> {
        self.mirror().expire();
        self.poll().await
    }

    /// Polls if the policy asks for it or the entity was never polled.
    async fn auto_poll(&self) -> Result<()> {
        if self.mirror().needs_auto_poll() {
            self.poll().await?;
        }
        Ok(())
    }

    /// Read-through lookup of one key.
    async fn get(&self, key: &str) -> Result<Value> {
        self.auto_poll().await?;
        self.mirror().lookup(key)
    }

    /// Read-through copy of the whole document.
    async fn data(&self) -> Result<Data> {
        self.auto_poll().await?;
        Ok(self.mirror().snapshot())
    }

    /// Adopts the state of `other` if it is strictly more recent.
    ///
    /// Returns true if anything changed. Merging an entity with itself, or an
    /// older representation into a newer one, is a no-op.
    async fn merge_from(&self, other: &Self) -> Result<bool> {
        if std::ptr::eq(self, other) {
            return Ok(false);
        }
        let theirs = other.mirror();
        let Some(polled_at) = theirs.last_poll() else {
            return Ok(false);
        };
        let mirror = self.mirror();
        let _gate = mirror.enter().await;
        if mirror.last_poll().is_some_and(|ours| ours >= polled_at) {
            return Ok(false);
        }
        mirror.apply_more_specific(&theirs.settings())?;
        let data = theirs.snapshot();
        if !mirror.store(data.clone(), polled_at) {
            return Ok(false);
        }
        tracing::debug!(url = %mirror.url(), "merged newer representation");
        self.absorb(&data, polled_at).await?;
        Ok(true)
    }
}
