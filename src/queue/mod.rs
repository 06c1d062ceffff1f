//! The build queue and its items.

mod correlate;
mod item;

pub use correlate::{find_submission, new_submission_token, SubmittedRequest, SUBMISSION_TOKEN_PARAM};
pub use item::{QueueItem, QueueState};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;
use crate::locator::{join_url, normalize_url, split_child};
use crate::lock;
use crate::mirror::{Context, Data, Mirror, Resource};
use crate::registry::EntityKind;
use crate::server::Server;

/// The build queue of one server.
pub struct Queue {
    mirror: Mirror,
    me: Weak<Queue>,
    server: Weak<Server>,
    items: Mutex<BTreeMap<u64, Arc<QueueItem>>>,
}

impl Queue {
    pub(crate) fn child_of(server: &Server) -> Result<Arc<Queue>> {
        let ctx = server.mirror().context();
        let url = join_url(&[server.url(), "queue"]);
        let settings = server.mirror().settings();
        let (queue, _) = ctx.registry.get_or_create(&url, &settings, |me| Queue {
            mirror: Mirror::new(ctx, url.clone(), settings.clone()),
            me: me.clone(),
            server: server.handle(),
            items: Mutex::new(BTreeMap::new()),
        })?;
        Ok(queue)
    }

    pub(crate) fn handle(&self) -> Weak<Queue> {
        self.me.clone()
    }

    pub(crate) fn context(&self) -> &Context {
        self.mirror.context()
    }

    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.upgrade()
    }

    /// The item with the given id. Does not contact the server.
    pub fn item(&self, id: u64) -> Result<Arc<QueueItem>> {
        if let Some(item) = lock(&self.items).get(&id) {
            return Ok(item.clone());
        }
        let item = QueueItem::child_of(self, id)?;
        Ok(lock(&self.items).entry(id).or_insert(item).clone())
    }

    /// Resolves an item URL such as a submission's `Location` header.
    ///
    /// Items of another queue are opened detached.
    pub fn item_at(&self, url: &str) -> Result<Arc<QueueItem>> {
        let url = normalize_url(url);
        match split_child(&url, Some("item")) {
            Some((parent, id)) if parent == self.url() => match id.parse() {
                Ok(id) => self.item(id),
                Err(_) => QueueItem::open_url(self.context(), &url, self.mirror.settings()),
            },
            _ => QueueItem::open_url(self.context(), &url, self.mirror.settings()),
        }
    }

    /// Items of the latest listing.
    pub async fn items(&self) -> Result<Vec<Arc<QueueItem>>> {
        self.auto_poll().await?;
        Ok(lock(&self.items).values().cloned().collect())
    }

    /// Finds the queued item of a submission to `job_name` with `expected`
    /// parameters. Always lists the queue afresh.
    pub async fn locate_submitted(
        &self,
        job_name: &str,
        expected: &BTreeMap<String, String>,
    ) -> Result<Arc<QueueItem>> {
        self.refresh().await?;
        let candidates: Vec<_> = lock(&self.items)
            .values()
            .map(|item| (SubmittedRequest::from_queue_data(&item.mirror().snapshot()), item.clone()))
            .collect();
        let item = find_submission(candidates, job_name, expected)?;
        tracing::info!(job = %job_name, item = item.id(), "located submitted build in queue");
        Ok(item)
    }
}

#[async_trait]
impl Resource for Queue {
    const KIND: EntityKind = EntityKind::Queue;

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    async fn absorb(&self, data: &Data, polled_at: Instant) -> Result<()> {
        let mut listed = BTreeSet::new();
        let entries = data.get("items").and_then(Value::as_array).into_iter().flatten();
        for entry in entries {
            let (Some(id), Some(fields)) = (entry.get("id").and_then(Value::as_u64), entry.as_object()) else {
                continue;
            };
            let item = self.item(id)?;
            item.poll_with(fields.clone(), polled_at).await?;
            listed.insert(id);
        }

        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|id, _| listed.contains(id));
        tracing::debug!(
            url = %self.url(),
            items = items.len(),
            pruned = before - items.len(),
            "queue listing refreshed"
        );
        Ok(())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("url", &self.url())
            .field("items", &lock(&self.items).keys().collect::<Vec<_>>())
            .finish()
    }
}
