//! Builds: one execution of a job.

mod artifacts;
mod console;

pub use artifacts::{destination, Artifact, ArtifactSet};
pub use console::{ConsoleChunk, ConsoleCursor, ConsoleEvent, ConsoleOptions, ConsoleStream};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::locator::{join_url, normalize_url, split_child, Locator};
use crate::mirror::{Context, Data, Mirror, PollPolicy, Resource, Settings, MIN_WAIT_INTERVAL};
use crate::registry::EntityKind;
use crate::transport::{Body, Method};

/// Final outcome of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    Success,
    Failure,
    Aborted,
    Unstable,
    NotBuilt,
    Unknown(String),
}

impl BuildResult {
    pub fn parse(result: &str) -> Self {
        match result {
            "SUCCESS" => BuildResult::Success,
            "FAILURE" => BuildResult::Failure,
            "ABORTED" => BuildResult::Aborted,
            "UNSTABLE" => BuildResult::Unstable,
            "NOT_BUILT" => BuildResult::NotBuilt,
            other => BuildResult::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Failure => "FAILURE",
            BuildResult::Aborted => "ABORTED",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::NotBuilt => "NOT_BUILT",
            BuildResult::Unknown(other) => other,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == BuildResult::Success
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build of a job.
pub struct Build {
    mirror: Mirror,
    number: u64,
    job: Weak<Job>,
    job_url: String,
    console: tokio::sync::Mutex<ConsoleCursor>,
    artifacts: ArtifactSet,
}

impl Build {
    fn new(ctx: &Context, url: String, number: u64, job: Weak<Job>, job_url: String, settings: Settings) -> Self {
        Self {
            artifacts: ArtifactSet::new(url.clone()),
            mirror: Mirror::new(ctx, url, settings),
            number,
            job,
            job_url,
            console: tokio::sync::Mutex::new(ConsoleCursor::default()),
        }
    }

    pub(crate) fn child_of(job: &Job, number: u64) -> Result<Arc<Build>> {
        let ctx = job.mirror().context();
        let url = Locator::child(job.url(), None, &number.to_string()).canonical();
        let settings = job.mirror().settings();
        let (build, _) = ctx.registry.get_or_create(&url, &settings, |_| {
            Build::new(ctx, url.clone(), number, job.handle(), job.url().to_string(), settings.clone())
        })?;
        Ok(build)
    }

    /// Opens a build from its bare URL. The job is resolved on demand.
    pub fn open_url(ctx: &Context, url: &str, settings: Settings) -> Result<Arc<Build>> {
        let url = normalize_url(url);
        let invalid = || Error::InvalidUrl {
            url: url.clone(),
            reason: "expected <job>/<number>".to_string(),
        };
        let (job_url, number) = split_child(&url, None).ok_or_else(invalid)?;
        let number: u64 = number.parse().map_err(|_| invalid())?;
        let (build, _) = ctx.registry.get_or_create(&url, &settings, |_| {
            Build::new(ctx, url.clone(), number, Weak::new(), job_url, settings.clone())
        })?;
        Ok(build)
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// The owning job, re-resolved through the registry when the link is gone.
    pub fn job(&self) -> Result<Arc<Job>> {
        match self.job.upgrade() {
            Some(job) => Ok(job),
            None => Job::open_url(self.mirror.context(), &self.job_url, self.mirror.settings()),
        }
    }

    pub async fn building(&self) -> Result<bool> {
        self.get("building")
            .await?
            .as_bool()
            .ok_or_else(|| Error::Decode {
                url: self.url().to_string(),
                reason: "'building' is not a boolean".to_string(),
            })
    }

    /// Final result. [`Error::NotYetAvailable`] while the build runs.
    pub async fn result(&self) -> Result<BuildResult> {
        match self.get("result").await? {
            Value::String(result) => Ok(BuildResult::parse(&result)),
            _ => Err(Error::NotYetAvailable {
                url: self.url().to_string(),
                what: "result".to_string(),
            }),
        }
    }

    pub async fn is_success(&self) -> Result<bool> {
        Ok(self.result().await? == BuildResult::Success)
    }

    pub async fn failed(&self) -> Result<bool> {
        Ok(self.result().await? == BuildResult::Failure)
    }

    pub async fn aborted(&self) -> Result<bool> {
        Ok(self.result().await? == BuildResult::Aborted)
    }

    fn finished_result(data: &Data) -> Option<BuildResult> {
        if data.get("building").and_then(Value::as_bool) != Some(false) {
            return None;
        }
        data.get("result")
            .and_then(Value::as_str)
            .map(BuildResult::parse)
    }

    /// Polls every `interval` (at least one second) until the build finished.
    pub async fn block(&self, interval: Duration, cancel: &CancellationToken) -> Result<BuildResult> {
        let interval = interval.max(MIN_WAIT_INTERVAL);
        if self.mirror.last_poll().is_some() {
            if let Some(result) = self.mirror.with_data(Self::finished_result) {
                return Ok(result);
            }
        }
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.refresh().await?;
            if let Some(result) = self.mirror.with_data(Self::finished_result) {
                return Ok(result);
            }
            tracing::debug!(build = %self.url(), wait = ?interval, "still building");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Streams the console log.
    pub fn console(self: &Arc<Self>, options: ConsoleOptions) -> ConsoleStream {
        ConsoleStream::new(self.clone(), options)
    }

    /// Fetches console text from the cursor's offset and advances it.
    pub async fn fetch_console(&self, cursor: &mut ConsoleCursor) -> Result<ConsoleChunk> {
        let url = join_url(&[self.url(), "logText/progressiveText"]);
        let body = Body::Form(vec![("start".to_string(), cursor.offset().to_string())]);
        let request = self.mirror.request(Method::Post, url.as_str(), body).idempotent();
        let response = self.mirror.send(request).await?;
        cursor.advance(&url, &response)
    }

    /// Artifacts of the build.
    pub async fn artifacts(&self) -> Result<Vec<Artifact>> {
        self.auto_poll().await?;
        Ok(self.artifacts.snapshot())
    }

    pub fn artifact_set(&self) -> &ArtifactSet {
        &self.artifacts
    }

    /// Downloads every artifact accepted by `filter` below `base`.
    ///
    /// `transform` maps an artifact's relative path to its path below `base`.
    /// Intermediate directories are created. The first failure aborts the whole
    /// operation. Returns the written paths.
    pub async fn write_artifacts<F, T>(&self, base: &Path, filter: F, transform: T) -> Result<Vec<PathBuf>>
    where
        F: Fn(&Artifact) -> bool + Send + Sync,
        T: Fn(&Path) -> PathBuf + Send + Sync,
    {
        self.auto_poll().await?;
        let mut written = Vec::new();
        for artifact in self.artifacts.snapshot() {
            if !filter(&artifact) {
                tracing::trace!(artifact = %artifact.relative_path, "skipped by filter");
                continue;
            }
            let target = destination(base, &transform(Path::new(&artifact.relative_path)))?;
            if let Some(dir) = target.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = tokio::fs::File::create(&target).await?;
            let bytes = self.mirror.download(&artifact.url, &mut file).await?;
            file.flush().await?;
            tracing::info!(
                artifact = %artifact.relative_path,
                path = %target.display(),
                bytes,
                "artifact written"
            );
            written.push(target);
        }
        Ok(written)
    }

    /// Downloads all artifacts below `base`, keeping their relative paths.
    pub async fn write_all_artifacts(&self, base: &Path) -> Result<Vec<PathBuf>> {
        self.write_artifacts(base, |_| true, Path::to_path_buf).await
    }
}

#[async_trait]
impl Resource for Build {
    const KIND: EntityKind = EntityKind::Build;

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    async fn absorb(&self, data: &Data, _polled_at: Instant) -> Result<()> {
        if let Some(listing) = data.get("artifacts").and_then(Value::as_array) {
            self.artifacts.update(listing);
        }
        if let Some(result) = Self::finished_result(data) {
            if self.mirror.poll_policy() != PollPolicy::Once {
                self.mirror.set_poll_policy(PollPolicy::Once);
                tracing::info!(build = %self.url(), result = %result, "build finished");
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Build")
            .field("number", &self.number)
            .field("url", &self.url())
            .field("job_url", &self.job_url)
            .finish()
    }
}
