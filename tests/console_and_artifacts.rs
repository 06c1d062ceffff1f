//! Integration tests for console streaming and artifact downloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use jenkins_mirror::{
    Client, ClientConfig, ConsoleEvent, ConsoleOptions, Error, Method, Response, ScriptedTransport,
};

const BUILD: &str = "http://ci/job/app/3";
const CONSOLE: &str = "http://ci/job/app/3/logText/progressiveText";

fn client(transport: &Arc<ScriptedTransport>) -> Client {
    Client::with_transport(ClientConfig::new("http://ci"), transport.clone())
        .expect("failed to create client")
}

fn progressive(size: u64, more: bool, text: &str) -> Response {
    Response::new(200)
        .with_header("X-Text-Size", size.to_string())
        .with_header("X-More-Data", more.to_string())
        .with_body(text)
}

/// Serves `log` in the given chunk sizes, with idle polls in between.
fn script_log(transport: &ScriptedTransport, log: &str, chunks: &[usize]) {
    let mut offset = 0;
    for (index, len) in chunks.iter().enumerate() {
        let end = offset + len;
        let last = index + 1 == chunks.len();
        transport.on(
            Method::Post,
            CONSOLE,
            progressive(end as u64, !last, &log[offset..end]),
        );
        if !last {
            transport.on(Method::Post, CONSOLE, progressive(end as u64, true, ""));
        }
        offset = end;
    }
}

#[tokio::test(start_paused = true)]
async fn streamed_lines_match_the_log_exactly() {
    let log = "first\nsecond line\nthird\n\nfifth\nsix";
    let transport = Arc::new(ScriptedTransport::new());
    script_log(&transport, log, &[3, 9, 10, 1, 7, log.len() - 30]);
    let client = client(&transport);
    let build = client.build_at(BUILD).unwrap();

    let lines = build
        .console(ConsoleOptions::blocking(Duration::from_secs(1)))
        .collect_lines()
        .await
        .unwrap();

    let expected: Vec<&str> = log.split('\n').collect();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn two_streams_never_share_a_line() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.on(Method::Post, CONSOLE, progressive(4, true, "a\nb\n"));
    transport.on(Method::Post, CONSOLE, progressive(6, false, "c\n"));
    let client = client(&transport);
    let build = client.build_at(BUILD).unwrap();

    let mut first = build.console(ConsoleOptions::non_blocking());
    let mut second = build.console(ConsoleOptions::non_blocking());

    assert_eq!(first.next_event().await.unwrap(), Some(ConsoleEvent::Line("a".into())));
    assert_eq!(second.next_event().await.unwrap(), Some(ConsoleEvent::Line("c".into())));
    assert_eq!(first.next_event().await.unwrap(), Some(ConsoleEvent::Line("b".into())));
    assert_eq!(first.next_event().await.unwrap(), None);
    assert_eq!(second.next_event().await.unwrap(), None);
}

#[tokio::test]
async fn cancelled_console_stops_waiting() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.on(Method::Post, CONSOLE, progressive(0, true, ""));
    let client = client(&transport);
    let build = client.build_at(BUILD).unwrap();
    let cancel = CancellationToken::new();
    let mut stream = build.console(
        ConsoleOptions::blocking(Duration::from_secs(3600)).with_cancellation(cancel.clone()),
    );

    let waiter = tokio::spawn(async move { stream.next_event().await });
    tokio::task::yield_now().await;
    cancel.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn console_protocol_errors_surface() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.on(
        Method::Post,
        CONSOLE,
        Response::new(200).with_header("X-More-Data", "true").with_body("x\n"),
    );
    let client = client(&transport);
    let build = client.build_at(BUILD).unwrap();

    let err = build
        .console(ConsoleOptions::non_blocking())
        .next_event()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConsoleProtocol { .. }));
    assert_eq!(transport.count(Method::Post, CONSOLE), 1);
}

fn script_artifacts(transport: &ScriptedTransport) {
    transport.on_json(
        BUILD,
        json!({"building": false, "result": "SUCCESS", "artifacts": [
            {"displayPath": "app.tar.gz", "fileName": "app.tar.gz", "relativePath": "dist/app.tar.gz"},
            {"displayPath": "notes.txt", "fileName": "notes.txt", "relativePath": "notes.txt"}
        ]}),
    );
    transport.on(
        Method::Get,
        "http://ci/job/app/3/artifact/dist/app.tar.gz",
        Response::new(200).with_body(vec![7u8; 20_000]),
    );
    transport.on(
        Method::Get,
        "http://ci/job/app/3/artifact/notes.txt",
        Response::new(200).with_body("release notes"),
    );
}

#[tokio::test]
async fn all_artifacts_are_written_below_the_base() {
    let transport = Arc::new(ScriptedTransport::new());
    script_artifacts(&transport);
    let client = client(&transport);
    let build = client.build_at(BUILD).unwrap();
    let out = TempDir::new().expect("failed to create temp dir");

    let mut written = build.write_all_artifacts(out.path()).await.unwrap();
    written.sort();

    assert_eq!(
        written,
        [out.path().join("dist/app.tar.gz"), out.path().join("notes.txt")]
    );
    assert_eq!(std::fs::read(out.path().join("dist/app.tar.gz")).unwrap().len(), 20_000);
    assert_eq!(
        std::fs::read_to_string(out.path().join("notes.txt")).unwrap(),
        "release notes"
    );
}

#[tokio::test]
async fn destination_paths_can_be_flattened() {
    let transport = Arc::new(ScriptedTransport::new());
    script_artifacts(&transport);
    let client = client(&transport);
    let build = client.build_at(BUILD).unwrap();
    let out = TempDir::new().expect("failed to create temp dir");

    let flatten = |path: &Path| -> PathBuf { path.file_name().map(PathBuf::from).unwrap_or_default() };
    let written = build
        .write_artifacts(out.path(), |a| a.file_name.ends_with(".tar.gz"), flatten)
        .await
        .unwrap();

    assert_eq!(written, [out.path().join("app.tar.gz")]);
    assert!(!out.path().join("dist").exists());
}
