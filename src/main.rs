//! jenkins-build CLI
//!
//! Submits a build of one job, waits for it, mirrors its console to stdout and
//! optionally downloads its artifacts.
//!
//! Exit codes: 0 on success, 1 if the build was cancelled while queued, 10 if
//! the build finished unsuccessfully, 2 on any other failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jenkins_mirror::{
    BuildRequest, Client, ClientConfig, ConsoleEvent, ConsoleOptions, Error, FileParameter,
    QueueState, Resource,
};

const EXIT_CANCELLED: u8 = 1;
const EXIT_FAILURE: u8 = 2;
const EXIT_UNSUCCESSFUL: u8 = 10;

/// Build a Jenkins job
#[derive(Parser, Debug)]
#[command(name = "jenkins-build")]
#[command(version, about, long_about = None)]
struct Args {
    /// Jenkins URL
    #[arg(long, env = "JENKINS_URL")]
    jenkins: Option<String>,

    /// Job name
    #[arg(long)]
    job: String,

    /// Jenkins user
    #[arg(long)]
    user: Option<String>,

    /// User password or API token
    #[arg(long)]
    password: Option<String>,

    /// Job's remote build token
    #[arg(long)]
    token: Option<String>,

    /// Prefix of mirrored console lines
    #[arg(long, default_value = "remote> ")]
    prefix: String,

    /// Do not wait until the build finishes
    #[arg(long)]
    noblock: bool,

    /// Do not copy console output to stdout
    #[arg(long)]
    noconsole: bool,

    /// Build cause
    #[arg(long)]
    cause: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    level: String,

    /// Artifacts to download: a regex matched against relative paths, or ALL
    #[arg(long)]
    artifacts: Option<String>,

    /// Directory receiving downloaded artifacts
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Build parameters: name=value, or name=@filename for file parameters
    #[arg(value_name = "PARAM")]
    params: Vec<String>,
}

/// Which artifacts to download.
enum ArtifactFilter {
    All,
    Matching(Regex),
}

impl ArtifactFilter {
    fn parse(pattern: &str) -> Result<Self, Error> {
        if pattern == "ALL" {
            return Ok(ArtifactFilter::All);
        }
        Regex::new(pattern)
            .map(ArtifactFilter::Matching)
            .map_err(|e| Error::Config(format!("invalid artifact regex '{}': {}", pattern, e)))
    }

    fn accepts(&self, relative_path: &str) -> bool {
        match self {
            ArtifactFilter::All => true,
            ArtifactFilter::Matching(regex) => regex.is_match(relative_path),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match run(args, cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("jenkins-build: {}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn load_config(args: &Args) -> Result<ClientConfig, Error> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::new(String::new()),
    }
    .with_env_overrides();

    if let Some(url) = &args.jenkins {
        config.url = url.clone();
    }
    if let Some(user) = &args.user {
        config.credentials.username = Some(user.clone());
    }
    if let Some(password) = &args.password {
        config.credentials.password = Some(password.clone());
    }
    if let Some(token) = &args.token {
        config.credentials.token = Some(token.clone());
    }
    Ok(config)
}

async fn build_request(args: &Args) -> Result<BuildRequest, Error> {
    let mut request = BuildRequest::new();
    for param in &args.params {
        let (name, value) = param
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("parameter '{}' is not name=value", param)))?;
        match value.strip_prefix('@') {
            Some(path) => {
                let path = PathBuf::from(path);
                let content = tokio::fs::read(&path).await?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.to_string());
                request = request.file(FileParameter {
                    name: name.to_string(),
                    file_name,
                    content,
                });
            }
            None => request = request.param(name, value),
        }
    }
    if let Some(cause) = &args.cause {
        request = request.cause(cause.clone());
    }
    Ok(request)
}

async fn run(args: Args, cancel: CancellationToken) -> Result<u8, Error> {
    let artifact_filter = args.artifacts.as_deref().map(ArtifactFilter::parse).transpose()?;
    let client = Client::new(load_config(&args)?)?;
    let interval = client.block_interval();
    let job = client.job(&args.job)?;

    let request = build_request(&args).await?;
    let item = job.enqueue(request).await?;
    tracing::info!(item = %item.url(), "job enqueued");

    // Streaming the console implies waiting.
    if args.noblock && args.noconsole {
        return Ok(0);
    }

    tracing::debug!("waiting for build to be dequeued");
    if item.block(interval, &cancel).await? == QueueState::Cancelled {
        tracing::error!(item = %item.url(), "build cancelled while queued");
        return Ok(EXIT_CANCELLED);
    }
    let build = item.build().await?;
    tracing::debug!(build = %build.url(), "build dequeued");

    if args.noconsole {
        build.block(interval, &cancel).await?;
    } else {
        let options = ConsoleOptions::blocking(std::time::Duration::from_secs(1))
            .reset()
            .with_cancellation(cancel.clone());
        let mut console = build.console(options);
        while let Some(event) = console.next_event().await? {
            if let ConsoleEvent::Line(line) = event {
                println!("{}{}", args.prefix, line);
            }
        }
        if build.block(interval, &cancel).await.is_err() {
            tracing::warn!(build = %build.url(), "console ended but the build state is unknown");
        }
    }

    if let Some(filter) = artifact_filter {
        let written = build
            .write_artifacts(
                &args.output,
                |artifact| filter.accepts(&artifact.relative_path),
                std::path::Path::to_path_buf,
            )
            .await?;
        tracing::info!(count = written.len(), output = %args.output.display(), "artifacts downloaded");
    }

    let result = build.result().await?;
    if !result.is_success() {
        tracing::error!(result = %result, "build finished unsuccessfully");
        return Ok(EXIT_UNSUCCESSFUL);
    }
    tracing::info!(result = %result, "build finished");
    Ok(0)
}
