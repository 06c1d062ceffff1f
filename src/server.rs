//! Root of the object graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;
use crate::job::Job;
use crate::locator::{normalize_url, Locator};
use crate::lock;
use crate::mirror::{Context, Data, Mirror, Resource, Settings};
use crate::queue::Queue;
use crate::registry::EntityKind;

/// A Jenkins server. Owns the job collection and the build queue.
pub struct Server {
    mirror: Mirror,
    me: Weak<Server>,
    jobs: Mutex<BTreeMap<String, Arc<Job>>>,
    queue: Mutex<Option<Arc<Queue>>>,
}

impl Server {
    /// Opens the server at `url`, reusing a live instance when there is one.
    pub fn open(ctx: &Context, url: &str, settings: Settings) -> Result<Arc<Server>> {
        let url = normalize_url(url);
        let (server, _) = ctx.registry.get_or_create(&url, &settings, |me| Server {
            mirror: Mirror::new(ctx, url.clone(), settings.clone()),
            me: me.clone(),
            jobs: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(None),
        })?;
        Ok(server)
    }

    pub(crate) fn handle(&self) -> Weak<Server> {
        self.me.clone()
    }

    /// Canonical URL of the job called `name`.
    pub fn job_url(&self, name: &str) -> String {
        Locator::child(self.url(), Some("job"), name).canonical()
    }

    /// The build queue of this server.
    pub fn queue(&self) -> Result<Arc<Queue>> {
        if let Some(queue) = lock(&self.queue).as_ref() {
            return Ok(queue.clone());
        }
        let queue = Queue::child_of(self)?;
        Ok(lock(&self.queue).get_or_insert(queue).clone())
    }

    /// The job called `name`. Does not contact the server.
    pub fn job(&self, name: &str) -> Result<Arc<Job>> {
        if let Some(job) = lock(&self.jobs).get(name) {
            return Ok(job.clone());
        }
        let job = Job::child_of(self, name)?;
        Ok(lock(&self.jobs)
            .entry(name.to_string())
            .or_insert(job)
            .clone())
    }

    /// All jobs of the latest listing.
    pub async fn jobs(&self) -> Result<Vec<Arc<Job>>> {
        self.auto_poll().await?;
        Ok(lock(&self.jobs).values().cloned().collect())
    }
}

#[async_trait]
impl Resource for Server {
    const KIND: EntityKind = EntityKind::Server;

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    async fn absorb(&self, data: &Data, _polled_at: Instant) -> Result<()> {
        let names: BTreeSet<String> = data
            .get("jobs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|job| job.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        for name in &names {
            self.job(name)?;
        }

        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|name, _| names.contains(name));
        tracing::debug!(
            url = %self.url(),
            jobs = jobs.len(),
            pruned = before - jobs.len(),
            "job listing refreshed"
        );
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("url", &self.url())
            .field("jobs", &lock(&self.jobs).keys().collect::<Vec<_>>())
            .finish()
    }
}
