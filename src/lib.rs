//! jenkins-mirror - a lazily polled local mirror of a Jenkins server.
//!
//! The crate keeps jobs, builds, the build queue and artifacts of a remote
//! Jenkins instance in a local object graph. Every entity is a polling cache
//! over one remote JSON document, deduplicated by canonical URL through an
//! explicit [`Registry`]. On top of the mirror sit the long-running operations:
//! submitting a build and correlating it with its queue item, waiting for the
//! item to start, streaming the console and downloading artifacts.

pub mod auth;
pub mod build;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod locator;
pub mod mirror;
pub mod queue;
pub mod registry;
pub mod server;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use auth::Credentials;
pub use build::{
    Artifact, ArtifactSet, Build, BuildResult, ConsoleEvent, ConsoleOptions, ConsoleStream,
};
pub use client::Client;
pub use config::{ClientConfig, RetryConfig, Validate, ValidationResult};
pub use error::{Error, Result};
pub use job::{BuildRequest, FileParameter, Job, ParameterDefinition};
pub use locator::{Locator, OpaqueRemote, Parent};
pub use mirror::{Context, Data, Mirror, PollPolicy, Resource, Settings};
pub use queue::{Queue, QueueItem, QueueState, SUBMISSION_TOKEN_PARAM};
pub use registry::{EntityKind, Registry};
pub use server::Server;
pub use transport::{
    Body, FilePart, HttpTransport, Method, Request, Response, RetryPolicy, Retrying, Transport,
};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::ScriptedTransport;

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
