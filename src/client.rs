//! Entry point tying configuration, transport and the object graph together.

use std::sync::Arc;
use std::time::Duration;

use crate::build::Build;
use crate::config::{ClientConfig, Validate};
use crate::error::{Error, Result};
use crate::job::Job;
use crate::locator::{normalize_url, split_child};
use crate::mirror::{Context, Resource};
use crate::queue::QueueItem;
use crate::server::Server;
use crate::transport::{HttpTransport, Retrying, Transport};

/// A connection to one Jenkins server.
///
/// Owns the [`Context`] shared by all entities and the root [`Server`]. Entities
/// reached through a client are deduplicated by the context's registry.
pub struct Client {
    ctx: Context,
    server: Arc<Server>,
    config: ClientConfig,
}

impl Client {
    /// Validates `config` and connects over HTTP with retries.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::check(&config)?;
        let http = HttpTransport::new(config.connect_timeout())?;
        let transport = Retrying::new(http, config.retry_policy());
        Self::with_context(config, Context::new(Arc::new(transport)))
    }

    /// Uses the given transport instead of HTTP.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::check(&config)?;
        Self::with_context(config, Context::new(transport))
    }

    /// Uses an existing context, sharing its registry.
    pub fn with_context(config: ClientConfig, ctx: Context) -> Result<Self> {
        let server = Server::open(&ctx, &config.url, config.settings())?;
        tracing::debug!(url = %server.url(), "client ready");
        Ok(Self {
            ctx,
            server,
            config,
        })
    }

    fn check(config: &ClientConfig) -> Result<()> {
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }
        Ok(())
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sleep between polls of waiting loops.
    pub fn block_interval(&self) -> Duration {
        self.config.block_interval()
    }

    /// The job called `name` on this server.
    pub fn job(&self, name: &str) -> Result<Arc<Job>> {
        self.server.job(name)
    }

    /// A job by URL. Jobs of this server are linked to it, others are detached.
    pub fn job_at(&self, url: &str) -> Result<Arc<Job>> {
        let url = normalize_url(url);
        match split_child(&url, Some("job")) {
            Some((parent, name)) if parent == self.server.url() => self.server.job(&name),
            _ => Job::open_url(&self.ctx, &url, self.config.settings()),
        }
    }

    /// A build by URL.
    pub fn build_at(&self, url: &str) -> Result<Arc<Build>> {
        let url = normalize_url(url);
        let number = split_child(&url, None).and_then(|(job_url, number)| {
            number.parse::<u64>().ok().map(|number| (job_url, number))
        });
        match number {
            Some((job_url, number)) => self.job_at(&job_url)?.build(number),
            None => Err(Error::InvalidUrl {
                url,
                reason: "expected <job>/<number>".to_string(),
            }),
        }
    }

    /// A queue item by URL.
    pub fn queue_item_at(&self, url: &str) -> Result<Arc<QueueItem>> {
        self.server.queue()?.item_at(url)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server.url())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn client() -> Client {
        Client::with_transport(ClientConfig::new("http://ci/"), Arc::new(ScriptedTransport::new())).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Client::with_transport(ClientConfig::new("ci"), Arc::new(ScriptedTransport::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn job_by_url_and_by_name_agree() {
        let client = client();
        let by_name = client.job("app").unwrap();
        let by_url = client.job_at("http://ci/job/app/").unwrap();
        assert!(Arc::ptr_eq(&by_name, &by_url));
        assert!(by_url.server().is_some());
    }

    #[test]
    fn foreign_job_is_detached() {
        let client = client();
        let job = client.job_at("http://elsewhere/job/app").unwrap();
        assert!(job.server().is_none());
    }

    #[test]
    fn build_by_url_links_to_job() {
        let client = client();
        let build = client.build_at("http://ci/job/app/12/").unwrap();
        assert_eq!(build.number(), 12);
        assert!(Arc::ptr_eq(&build.job().unwrap(), &client.job("app").unwrap()));
        assert!(client.build_at("http://ci/job/app/last").is_err());
    }

    #[test]
    fn queue_item_by_url() {
        let client = client();
        let item = client.queue_item_at("http://ci/queue/item/8/").unwrap();
        assert_eq!(item.id(), 8);
        assert!(item.queue().is_some());
    }

    #[test]
    fn debug_hides_password() {
        let mut config = ClientConfig::new("http://ci");
        config.credentials = crate::auth::Credentials::basic("alice", "hunter2");
        let client = Client::with_transport(config, Arc::new(ScriptedTransport::new())).unwrap();
        assert!(!format!("{:?}", client).contains("hunter2"));
    }
}
