//! Queue items: submitted builds waiting for an executor.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Queue, SubmittedRequest};
use crate::build::Build;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::locator::{normalize_url, split_child, Locator, OpaqueRemote, Parent};
use crate::lock;
use crate::mirror::{Context, Data, Mirror, PollPolicy, Resource, Settings, MIN_WAIT_INTERVAL};
use crate::registry::EntityKind;

/// Where a queue item stands. `Dequeued` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Queued,
    /// An executor picked the item up and started the build.
    Dequeued { build_number: u64 },
    Cancelled,
}

impl QueueState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueState::Queued)
    }

    fn from_data(data: &Data) -> Self {
        if data.get("cancelled").and_then(Value::as_bool) == Some(true) {
            return QueueState::Cancelled;
        }
        match data
            .get("executable")
            .and_then(|exe| exe.get("number"))
            .and_then(Value::as_u64)
        {
            Some(build_number) => QueueState::Dequeued { build_number },
            None => QueueState::Queued,
        }
    }
}

/// A submitted build request.
pub struct QueueItem {
    mirror: Mirror,
    id: u64,
    parent: Parent<Queue>,
    outcome: Mutex<Option<QueueState>>,
}

impl QueueItem {
    pub(crate) fn child_of(queue: &Queue, id: u64) -> Result<Arc<QueueItem>> {
        let ctx = queue.context();
        let url = Locator::child(queue.url(), Some("item"), &id.to_string()).canonical();
        let settings = queue.mirror().settings();
        let (item, _) = ctx.registry.get_or_create(&url, &settings, |_| {
            QueueItem::new(ctx, url.clone(), id, Parent::Linked(queue.handle()), settings.clone())
        })?;
        Ok(item)
    }

    /// Opens an item from its bare URL, with no traversable queue.
    pub fn open_url(ctx: &Context, url: &str, settings: Settings) -> Result<Arc<QueueItem>> {
        let url = normalize_url(url);
        let invalid = || Error::InvalidUrl {
            url: url.clone(),
            reason: "expected <server>/queue/item/<id>".to_string(),
        };
        let (parent_url, id) = split_child(&url, Some("item")).ok_or_else(invalid)?;
        let id: u64 = id.parse().map_err(|_| invalid())?;
        let (item, _) = ctx.registry.get_or_create(&url, &settings, |_| {
            let parent = Parent::Opaque(OpaqueRemote::new(parent_url));
            QueueItem::new(ctx, url.clone(), id, parent, settings.clone())
        })?;
        Ok(item)
    }

    fn new(ctx: &Context, url: String, id: u64, parent: Parent<Queue>, settings: Settings) -> Self {
        Self {
            mirror: Mirror::new(ctx, url, settings),
            id,
            parent,
            outcome: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The owning queue, unless the item was opened from a bare URL.
    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.parent.upgrade()
    }

    fn outcome(&self) -> Option<QueueState> {
        *lock(&self.outcome)
    }

    /// Current state. Final states are served without contacting the server.
    pub async fn state(&self) -> Result<QueueState> {
        if let Some(outcome) = self.outcome() {
            return Ok(outcome);
        }
        self.auto_poll().await?;
        Ok(self.mirror.with_data(QueueState::from_data))
    }

    /// Job name and parameters recorded by Jenkins for this item.
    pub async fn submitted(&self) -> Result<SubmittedRequest> {
        self.auto_poll().await?;
        Ok(self.mirror.with_data(SubmittedRequest::from_queue_data))
    }

    /// The job this item builds.
    pub async fn job(&self) -> Result<Arc<Job>> {
        let task = self.get("task").await?;
        let name = task.get("name").and_then(Value::as_str);
        let url = task.get("url").and_then(Value::as_str).map(normalize_url);

        let server = self.queue().and_then(|queue| queue.server());
        if let (Some(server), Some(name)) = (server, name) {
            if url.as_deref().map_or(true, |url| url == server.job_url(name)) {
                return server.job(name);
            }
        }
        match url {
            Some(url) => Job::open_url(self.mirror.context(), &url, self.mirror.settings()),
            None => Err(Error::KeyNotFound {
                url: self.url().to_string(),
                key: "task.url".to_string(),
            }),
        }
    }

    /// The build this item turned into.
    ///
    /// Fails with [`Error::NotYetAvailable`] while the item is still queued or
    /// if it was cancelled.
    pub async fn build(&self) -> Result<Arc<Build>> {
        match self.state().await? {
            QueueState::Dequeued { build_number } => self.job().await?.build(build_number),
            QueueState::Queued => Err(Error::NotYetAvailable {
                url: self.url().to_string(),
                what: "build".to_string(),
            }),
            QueueState::Cancelled => Err(Error::NotYetAvailable {
                url: self.url().to_string(),
                what: "build of cancelled item".to_string(),
            }),
        }
    }

    /// Polls every `interval` until the item is dequeued or cancelled.
    ///
    /// The interval is raised to at least one second. Cancellation is checked
    /// between polls.
    pub async fn block(&self, interval: Duration, cancel: &CancellationToken) -> Result<QueueState> {
        let interval = interval.max(MIN_WAIT_INTERVAL);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(outcome) = self.outcome() {
                return Ok(outcome);
            }
            self.refresh().await?;
            if let Some(outcome) = self.outcome() {
                return Ok(outcome);
            }
            tracing::debug!(item = self.id, wait = ?interval, "still queued");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[async_trait]
impl Resource for QueueItem {
    const KIND: EntityKind = EntityKind::QueueItem;

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    async fn absorb(&self, data: &Data, _polled_at: Instant) -> Result<()> {
        let state = QueueState::from_data(data);
        if !state.is_terminal() {
            return Ok(());
        }
        let mut outcome = lock(&self.outcome);
        if outcome.is_none() {
            *outcome = Some(state);
            drop(outcome);
            self.mirror.set_poll_policy(PollPolicy::Once);
            tracing::info!(item = self.id, state = ?state, "queue item left the queue");
        }
        Ok(())
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("url", &self.url())
            .field("outcome", &self.outcome())
            .finish()
    }
}
