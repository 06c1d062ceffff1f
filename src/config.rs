//! Client configuration and its validation.
//!
//! Configuration is read from TOML, optionally overridden from the
//! environment, and validated before a client is built.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::mirror::{PollPolicy, Settings, MIN_WAIT_INTERVAL};
use crate::transport::RetryPolicy;

/// Environment variable overriding the server URL.
pub const ENV_URL: &str = "JENKINS_URL";
/// Environment variable overriding the username.
pub const ENV_USER: &str = "JENKINS_USER";
/// Environment variable overriding the password.
pub const ENV_PASSWORD: &str = "JENKINS_PASSWORD";
/// Environment variable overriding the API token.
pub const ENV_TOKEN: &str = "JENKINS_TOKEN";

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_block_interval_secs() -> u64 {
    5
}

/// Retry of transient network failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Everything needed to talk to one Jenkins server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server root URL.
    pub url: String,

    #[serde(default)]
    pub credentials: Credentials,

    /// Entity refresh interval. Absent: fetch once. Zero: fetch on every access.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Per-request timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Sleep between polls while waiting for a queue item or a build.
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,
}

impl ClientConfig {
    /// Creates a configuration with defaults for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: Credentials::none(),
            poll_interval_secs: None,
            timeout_secs: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            retry: RetryConfig::default(),
            block_interval_secs: default_block_interval_secs(),
        }
    }

    /// Reads a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parses a TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies `JENKINS_URL`, `JENKINS_USER`, `JENKINS_PASSWORD` and
    /// `JENKINS_TOKEN` when set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_URL) {
            self.url = url;
        }
        if let Some(user) = lookup(ENV_USER) {
            self.credentials.username = Some(user);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.credentials.password = Some(password);
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.credentials.token = Some(token);
        }
        self
    }

    /// Settings of the root entity.
    pub fn settings(&self) -> Settings {
        Settings {
            poll_policy: PollPolicy::from_secs(self.poll_interval_secs),
            credentials: self.credentials.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts, Duration::from_millis(self.retry.delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Wait-loop interval, raised to the one second minimum.
    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_secs).max(MIN_WAIT_INTERVAL)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal issues.
    pub errors: Vec<String>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Fails with [`Error::Config`] on errors, otherwise returns the warnings.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for Credentials {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.password.is_some() && self.username.is_none() {
            result.add_error("password given without a username");
        }

        if self.token.is_some() && (self.username.is_some() || self.password.is_some()) {
            result.add_warning("both an API token and username/password are configured; both will be sent");
        }

        result
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.max_attempts == 0 {
            result.add_error("retry.max_attempts must be at least 1");
        }
        result
    }
}

impl Validate for ClientConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let url = self.url.trim();
        if url.is_empty() {
            result.add_error("url cannot be empty");
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            result.add_error(format!("url '{}' must start with http:// or https://", url));
        }

        if self.block_interval_secs < 1 {
            result.add_warning("block_interval_secs below 1 second is raised to 1 second");
        }

        result.merge(self.credentials.validate());
        result.merge(self.retry.validate());
        result
    }
}
