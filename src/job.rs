//! Jobs: named build definitions, their builds and their parameters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::build::Build;
use crate::error::{Error, Result};
use crate::locator::{join_url, normalize_url, split_child, OpaqueRemote, Parent};
use crate::lock;
use crate::mirror::{Context, Data, Mirror, Resource, Settings};
use crate::queue::{new_submission_token, QueueItem, SUBMISSION_TOKEN_PARAM};
use crate::registry::EntityKind;
use crate::server::Server;
use crate::transport::{Body, FilePart};

/// A declared build parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    pub description: Option<String>,
    pub default: Option<Value>,
    /// Jenkins parameter class, e.g. `StringParameterDefinition`.
    pub kind: Option<String>,
}

impl ParameterDefinition {
    fn from_json(value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            name,
            description: text("description").filter(|d| !d.is_empty()),
            default: value
                .get("defaultParameterValue")
                .and_then(|default| default.get("value"))
                .filter(|v| !v.is_null())
                .cloned(),
            kind: text("type"),
        })
    }
}

/// A file uploaded as a build parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileParameter {
    /// Parameter name declared by the job.
    pub name: String,
    pub file_name: String,
    pub content: Vec<u8>,
}

/// Everything needed to submit one build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub params: BTreeMap<String, String>,
    pub files: Vec<FileParameter>,
    /// Free-text cause recorded by Jenkins.
    pub cause: Option<String>,
}

impl BuildRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn file(mut self, file: FileParameter) -> Self {
        self.files.push(file);
        self
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// A Jenkins job.
pub struct Job {
    mirror: Mirror,
    me: Weak<Job>,
    name: String,
    parent: Mutex<Parent<Server>>,
    builds: Mutex<BTreeMap<u64, Arc<Build>>>,
}

impl Job {
    fn new(ctx: &Context, url: String, name: &str, parent: Parent<Server>, settings: Settings, me: &Weak<Job>) -> Self {
        Self {
            mirror: Mirror::new(ctx, url, settings),
            me: me.clone(),
            name: name.to_string(),
            parent: Mutex::new(parent),
            builds: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens a job from its bare URL.
    ///
    /// The server is recorded as an opaque stand-in: such a job can be polled and
    /// can build, but cannot reach the queue for correlation.
    pub fn open_url(ctx: &Context, url: &str, settings: Settings) -> Result<Arc<Job>> {
        let url = normalize_url(url);
        let (parent_url, name) = split_child(&url, Some("job")).ok_or_else(|| Error::InvalidUrl {
            url: url.clone(),
            reason: "expected <server>/job/<name>".to_string(),
        })?;
        let (job, _) = ctx.registry.get_or_create(&url, &settings, |me| {
            let parent = Parent::Opaque(OpaqueRemote::new(parent_url));
            Job::new(ctx, url.clone(), &name, parent, settings.clone(), me)
        })?;
        Ok(job)
    }

    pub(crate) fn child_of(server: &Server, name: &str) -> Result<Arc<Job>> {
        let ctx = server.mirror().context();
        let url = server.job_url(name);
        let settings = server.mirror().settings();
        let (job, existed) = ctx.registry.get_or_create(&url, &settings, |me| {
            let parent = Parent::Linked(server.handle());
            Job::new(ctx, url.clone(), name, parent, settings.clone(), me)
        })?;
        if existed {
            job.attach(server);
        }
        Ok(job)
    }

    /// Links a job opened from a bare URL to its live server.
    fn attach(&self, server: &Server) {
        let mut parent = lock(&self.parent);
        if parent.is_opaque() {
            tracing::debug!(job = %self.name, server = %server.url(), "attaching job to server");
            *parent = Parent::Linked(server.handle());
        }
    }

    pub(crate) fn handle(&self) -> Weak<Job> {
        self.me.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning server, if this job is linked to a live one.
    pub fn server(&self) -> Option<Arc<Server>> {
        lock(&self.parent).upgrade()
    }

    /// The build with the given number. Does not contact the server.
    pub fn build(&self, number: u64) -> Result<Arc<Build>> {
        if let Some(build) = lock(&self.builds).get(&number) {
            return Ok(build.clone());
        }
        let build = Build::child_of(self, number)?;
        Ok(lock(&self.builds).entry(number).or_insert(build).clone())
    }

    /// Builds of the latest listing, oldest first.
    pub async fn builds(&self) -> Result<Vec<Arc<Build>>> {
        self.auto_poll().await?;
        Ok(lock(&self.builds).values().cloned().collect())
    }

    /// The most recent build, if the job ever ran.
    pub async fn last_build(&self) -> Result<Option<Arc<Build>>> {
        self.auto_poll().await?;
        let number = self
            .mirror
            .with_data(|data| data.get("lastBuild").and_then(|b| b.get("number")).and_then(Value::as_u64));
        number.map(|number| self.build(number)).transpose()
    }

    /// Declared build parameters.
    pub async fn parameters(&self) -> Result<Vec<ParameterDefinition>> {
        self.auto_poll().await?;
        Ok(self.mirror.with_data(parameter_definitions))
    }

    /// Submits a build and returns its queue item.
    ///
    /// Without file parameters the queue item is taken from the `Location`
    /// header. File uploads go through the plain `build` endpoint, which does not
    /// report the queue item, so the item is located by its parameters instead.
    pub async fn enqueue(&self, request: BuildRequest) -> Result<Arc<QueueItem>> {
        if request.files.is_empty() {
            self.enqueue_simple(request).await
        } else {
            self.enqueue_with_files(request).await
        }
    }

    async fn enqueue_simple(&self, request: BuildRequest) -> Result<Arc<QueueItem>> {
        let endpoint = if request.params.is_empty() {
            "build"
        } else {
            "buildWithParameters"
        };
        let url = join_url(&[self.url(), endpoint]);

        let mut fields: Vec<(String, String)> = request
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if let Some(cause) = &request.cause {
            fields.push(("cause".to_string(), cause.clone()));
        }
        let body = if fields.is_empty() {
            Body::Empty
        } else {
            Body::Form(fields)
        };

        let response = self.mirror.post(&url, body).await?;
        tracing::info!(job = %self.name, params = request.params.len(), "build submitted");

        match response.header("location") {
            Some(location) => self.queue_item_at(location),
            None => {
                tracing::warn!(job = %self.name, "no queue location returned, locating build by parameters");
                let queue = self.queue()?;
                queue.locate_submitted(&self.name, &request.params).await
            }
        }
    }

    async fn enqueue_with_files(&self, request: BuildRequest) -> Result<Arc<QueueItem>> {
        let queue = self.queue()?;

        let mut params = request.params.clone();
        let declares_token = self
            .parameters()
            .await?
            .iter()
            .any(|p| p.name == SUBMISSION_TOKEN_PARAM);
        if declares_token {
            params.insert(SUBMISSION_TOKEN_PARAM.to_string(), new_submission_token());
        } else {
            tracing::warn!(
                job = %self.name,
                "job does not declare {}, concurrent identical submissions may be confused",
                SUBMISSION_TOKEN_PARAM
            );
        }

        let mut entries: Vec<Value> = params
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        let mut files = Vec::with_capacity(request.files.len());
        for (index, file) in request.files.iter().enumerate() {
            let field = format!("file{}", index);
            entries.push(json!({"name": file.name, "file": field}));
            files.push(FilePart {
                field,
                file_name: file.file_name.clone(),
                content: file.content.clone(),
            });
        }

        let mut fields = vec![("json".to_string(), json!({ "parameter": entries }).to_string())];
        if let Some(cause) = &request.cause {
            fields.push(("cause".to_string(), cause.clone()));
        }

        let url = join_url(&[self.url(), "build"]);
        self.mirror.post(&url, Body::Multipart { fields, files }).await?;
        tracing::info!(
            job = %self.name,
            params = params.len(),
            files = request.files.len(),
            "build with file parameters submitted"
        );

        queue.locate_submitted(&self.name, &params).await
    }

    fn queue(&self) -> Result<Arc<crate::queue::Queue>> {
        match self.server() {
            Some(server) => server.queue(),
            None => Err(Error::Detached {
                url: self.url().to_string(),
            }),
        }
    }

    fn queue_item_at(&self, location: &str) -> Result<Arc<QueueItem>> {
        match self.server() {
            Some(server) => server.queue()?.item_at(location),
            None => QueueItem::open_url(self.mirror.context(), location, self.mirror.settings()),
        }
    }
}

fn parameter_definitions(data: &Data) -> Vec<ParameterDefinition> {
    let mut seen = BTreeSet::new();
    ["property", "actions"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|entry| entry.get("parameterDefinitions").and_then(Value::as_array))
        .flatten()
        .filter_map(ParameterDefinition::from_json)
        .filter(|definition| seen.insert(definition.name.clone()))
        .collect()
}

#[async_trait]
impl Resource for Job {
    const KIND: EntityKind = EntityKind::Job;

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    async fn absorb(&self, data: &Data, _polled_at: Instant) -> Result<()> {
        let numbers: BTreeSet<u64> = data
            .get("builds")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|build| build.get("number").and_then(Value::as_u64))
            .collect();

        for number in &numbers {
            self.build(*number)?;
        }

        let mut builds = lock(&self.builds);
        let before = builds.len();
        builds.retain(|number, _| numbers.contains(number));
        tracing::debug!(
            job = %self.name,
            builds = builds.len(),
            pruned = before - builds.len(),
            "build listing refreshed"
        );
        Ok(())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("url", &self.url())
            .field("parent", &*lock(&self.parent))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Method, Response, ScriptedTransport};

    const SERVER: &str = "http://ci";
    const JOB: &str = "http://ci/job/app";

    fn setup() -> (Arc<ScriptedTransport>, Arc<Server>) {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = Context::new(transport.clone());
        let server = Server::open(&ctx, SERVER, Settings::default()).unwrap();
        (transport, server)
    }

    #[tokio::test]
    async fn parameters_come_from_properties_and_actions() {
        let (transport, server) = setup();
        transport.on_json(
            JOB,
            json!({
                "property": [{"parameterDefinitions": [
                    {"name": "FOO", "type": "StringParameterDefinition",
                     "description": "foo", "defaultParameterValue": {"value": "x"}}
                ]}],
                "actions": [{}, {"parameterDefinitions": [
                    {"name": "FOO", "type": "StringParameterDefinition"},
                    {"name": "DATA", "type": "FileParameterDefinition", "description": ""}
                ]}]
            }),
        );
        let job = server.job("app").unwrap();

        let params = job.parameters().await.unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "FOO");
        assert_eq!(params[0].default, Some(json!("x")));
        assert_eq!(params[0].description.as_deref(), Some("foo"));
        assert_eq!(params[1].name, "DATA");
        assert_eq!(params[1].description, None);
        assert_eq!(params[1].kind.as_deref(), Some("FileParameterDefinition"));
    }

    #[tokio::test]
    async fn poll_prunes_and_adds_builds() {
        let (transport, server) = setup();
        transport.on_json(JOB, json!({"builds": [{"number": 3}, {"number": 2}]}));
        transport.on_json(JOB, json!({"builds": [{"number": 4}, {"number": 3}]}));
        let job = server.job("app").unwrap();

        let numbers: Vec<u64> = job.builds().await.unwrap().iter().map(|b| b.number()).collect();
        assert_eq!(numbers, [2, 3]);

        job.poll().await.unwrap();
        let numbers: Vec<u64> = lock(&job.builds).keys().copied().collect();
        assert_eq!(numbers, [3, 4]);
    }

    #[tokio::test]
    async fn last_build_follows_the_listing() {
        let (transport, server) = setup();
        transport.on_json(JOB, json!({"lastBuild": {"number": 7}, "builds": [{"number": 7}]}));
        let job = server.job("app").unwrap();

        let last = job.last_build().await.unwrap().unwrap();

        assert_eq!(last.number(), 7);
        assert_eq!(last.url(), "http://ci/job/app/7");
    }

    #[tokio::test]
    async fn never_built_job_has_no_last_build() {
        let (transport, server) = setup();
        transport.on_json(JOB, json!({"lastBuild": null, "builds": []}));
        let job = server.job("app").unwrap();

        assert!(job.last_build().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn simple_parameters_use_location_header() {
        let (transport, server) = setup();
        transport.on(
            Method::Post,
            "http://ci/job/app/buildWithParameters",
            Response::new(201).with_header("Location", "http://ci/queue/item/42/"),
        );
        let job = server.job("app").unwrap();

        let item = job
            .enqueue(BuildRequest::new().param("FOO", "1").cause("nightly"))
            .await
            .unwrap();

        assert_eq!(item.id(), 42);
        assert_eq!(item.url(), "http://ci/queue/item/42");
        let sent = &transport.requests()[0];
        assert_eq!(
            sent.body,
            Body::Form(vec![
                ("FOO".to_string(), "1".to_string()),
                ("cause".to_string(), "nightly".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn parameterless_builds_post_to_build() {
        let (transport, server) = setup();
        transport.on(
            Method::Post,
            "http://ci/job/app/build",
            Response::new(201).with_header("Location", "http://ci/queue/item/5/"),
        );
        let job = server.job("app").unwrap();

        job.enqueue(BuildRequest::new()).await.unwrap();

        assert_eq!(transport.count(Method::Post, "http://ci/job/app/build"), 1);
        assert_eq!(transport.requests()[0].body, Body::Empty);
    }

    #[tokio::test]
    async fn failed_submission_is_reported() {
        let (transport, server) = setup();
        transport.on(Method::Post, "http://ci/job/app/buildWithParameters", Response::new(403));
        let job = server.job("app").unwrap();

        let err = job.enqueue(BuildRequest::new().param("FOO", "1")).await.unwrap_err();

        assert!(matches!(err, Error::RemoteRequestFailed { status: 403, .. }));
    }

    #[tokio::test]
    async fn detached_job_cannot_correlate_file_uploads() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = Context::new(transport.clone());
        let job = Job::open_url(&ctx, "http://ci/job/app/", Settings::default()).unwrap();
        let request = BuildRequest::new().file(FileParameter {
            name: "DATA".to_string(),
            file_name: "data.txt".to_string(),
            content: b"hello".to_vec(),
        });

        let err = job.enqueue(request).await.unwrap_err();

        assert!(matches!(err, Error::Detached { .. }));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn bare_url_job_attaches_to_server_later() {
        let (_transport, server) = setup();
        let ctx = server.mirror().context().clone();
        let detached = Job::open_url(&ctx, "http://ci/job/app", Settings::default()).unwrap();
        assert!(detached.server().is_none());

        let linked = server.job("app").unwrap();

        assert!(Arc::ptr_eq(&detached, &linked));
        assert!(detached.server().is_some());
    }

    #[test]
    fn malformed_job_url_is_rejected() {
        let (_transport, server) = setup();
        let ctx = server.mirror().context().clone();
        let err = Job::open_url(&ctx, "http://ci/view/app", Settings::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }
}
