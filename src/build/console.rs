//! Progressive console output.
//!
//! Jenkins serves the console log incrementally: a POST with `start=<offset>`
//! returns the text from that offset, the new total size in `X-Text-Size` and
//! whether the log is still growing in `X-More-Data`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::Build;
use crate::error::{Error, Result};
use crate::mirror::Resource;
use crate::transport::Response;

/// Read position in a build's console log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleCursor {
    offset: u64,
    more_data: bool,
    /// Bytes after the last newline, held back until their line completes.
    /// Offsets are byte offsets, so a chunk may end inside a character.
    partial: Vec<u8>,
}

impl Default for ConsoleCursor {
    fn default() -> Self {
        Self {
            offset: 0,
            more_data: true,
            partial: Vec::new(),
        }
    }
}

/// Result of one progressive fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleChunk {
    /// The log did not grow but is not finished.
    Pending,
    /// Completed lines, in order.
    Lines { lines: Vec<String>, more_data: bool },
}

impl ConsoleCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// False once the server reported the end of the log.
    pub fn more_data(&self) -> bool {
        self.more_data
    }

    /// Rewinds to the start of the log.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Applies one progressive response fetched from the current offset.
    pub fn advance(&mut self, url: &str, response: &Response) -> Result<ConsoleChunk> {
        let protocol = |reason: String| Error::ConsoleProtocol {
            url: url.to_string(),
            reason,
        };

        let size = response
            .header("x-text-size")
            .ok_or_else(|| protocol("missing X-Text-Size header".to_string()))?;
        let new_size: u64 = size
            .trim()
            .parse()
            .map_err(|_| protocol(format!("malformed X-Text-Size header '{}'", size)))?;
        let more_data = match response.header("x-more-data").map(str::trim) {
            None => false,
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) => return Err(protocol(format!("malformed X-More-Data header '{}'", value))),
        };

        if new_size < self.offset {
            return Err(protocol(format!(
                "log shrank from {} to {} bytes",
                self.offset, new_size
            )));
        }
        if new_size == self.offset && more_data {
            return Ok(ConsoleChunk::Pending);
        }

        self.offset = new_size;
        self.more_data = more_data;
        self.partial.extend_from_slice(&response.body);

        let mut lines = Vec::new();
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            lines.push(decode_line(&line));
        }
        if !more_data && !self.partial.is_empty() {
            lines.push(decode_line(&std::mem::take(&mut self.partial)));
        }

        Ok(ConsoleChunk::Lines { lines, more_data })
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

/// How a console stream waits for new output.
#[derive(Debug, Clone, Default)]
pub struct ConsoleOptions {
    /// Sleep between fetches while the log is idle. `None` or zero makes the
    /// stream yield [`ConsoleEvent::NoDataYet`] instead.
    pub poll_interval: Option<Duration>,
    /// Start over from the beginning of the log.
    pub reset: bool,
    pub cancel: Option<CancellationToken>,
}

impl ConsoleOptions {
    /// Waits for output, polling every `interval`.
    pub fn blocking(interval: Duration) -> Self {
        Self {
            poll_interval: Some(interval),
            ..Self::default()
        }
    }

    /// Never sleeps; reports idle logs as [`ConsoleEvent::NoDataYet`].
    pub fn non_blocking() -> Self {
        Self::default()
    }

    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Line(String),
    /// The log is idle; only produced by non-blocking streams.
    NoDataYet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Finished,
    Ended,
}

/// Stream of console lines of one build.
///
/// Streams share the build's cursor: every line is delivered exactly once across
/// all streams of a build, unless a stream is opened with `reset`.
pub struct ConsoleStream {
    build: Arc<Build>,
    interval: Option<Duration>,
    reset_pending: bool,
    cancel: CancellationToken,
    pending: VecDeque<String>,
    fetched: bool,
    phase: Phase,
}

impl ConsoleStream {
    pub(crate) fn new(build: Arc<Build>, options: ConsoleOptions) -> Self {
        Self {
            build,
            interval: options.poll_interval.filter(|interval| !interval.is_zero()),
            reset_pending: options.reset,
            cancel: options.cancel.unwrap_or_default(),
            pending: VecDeque::new(),
            fetched: false,
            phase: Phase::Streaming,
        }
    }

    /// Returns the next event, or `None` once the log is complete.
    ///
    /// Calling again after `None`, or starting a stream on a log another
    /// stream already drained, fails with [`Error::NoMoreConsoleData`].
    pub async fn next_event(&mut self) -> Result<Option<ConsoleEvent>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(ConsoleEvent::Line(line)));
            }
            match self.phase {
                Phase::Ended => return Err(self.drained()),
                Phase::Finished => {
                    self.phase = Phase::Ended;
                    return Ok(None);
                }
                Phase::Streaming => {}
            }
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let chunk = {
                let mut cursor = self.build.console.lock().await;
                if std::mem::take(&mut self.reset_pending) {
                    cursor.reset();
                }
                if !cursor.more_data() {
                    if !self.fetched {
                        return Err(self.drained());
                    }
                    self.phase = Phase::Finished;
                    continue;
                }
                self.build.fetch_console(&mut cursor).await?
            };
            self.fetched = true;

            match chunk {
                ConsoleChunk::Lines { lines, more_data } => {
                    self.pending.extend(lines);
                    if !more_data {
                        self.phase = Phase::Finished;
                    }
                }
                ConsoleChunk::Pending => match self.interval {
                    None => return Ok(Some(ConsoleEvent::NoDataYet)),
                    Some(interval) => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                },
            }
        }
    }

    /// Drains the stream into a vector of lines. Requires a blocking stream.
    pub async fn collect_lines(mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(event) = self.next_event().await? {
            if let ConsoleEvent::Line(line) = event {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    fn drained(&self) -> Error {
        Error::NoMoreConsoleData {
            url: self.build.url().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(size: u64, more: bool, text: &str) -> Response {
        Response::new(200)
            .with_header("X-Text-Size", size.to_string())
            .with_header("X-More-Data", more.to_string())
            .with_body(text)
    }

    fn lines(chunk: ConsoleChunk) -> Vec<String> {
        match chunk {
            ConsoleChunk::Lines { lines, .. } => lines,
            ConsoleChunk::Pending => panic!("expected lines"),
        }
    }

    #[test]
    fn partial_lines_are_held_back() {
        let mut cursor = ConsoleCursor::default();

        let first = cursor.advance("u", &chunk(10, true, "one\ntwo-pa")).unwrap();
        assert_eq!(lines(first), ["one"]);
        assert_eq!(cursor.offset(), 10);

        let second = cursor.advance("u", &chunk(18, true, "rt\nthree")).unwrap();
        assert_eq!(lines(second), ["two-part"]);

        let last = cursor.advance("u", &chunk(18, false, "")).unwrap();
        assert_eq!(lines(last), ["three"]);
        assert!(!cursor.more_data());
    }

    #[test]
    fn characters_split_across_chunks_survive() {
        let log = "café\nnaïve";
        let bytes = log.as_bytes();
        let mut cursor = ConsoleCursor::default();

        let head = Response::new(200)
            .with_header("X-Text-Size", "4")
            .with_header("X-More-Data", "true")
            .with_body(&bytes[..4]);
        assert_eq!(lines(cursor.advance("u", &head).unwrap()), Vec::<String>::new());

        let middle = Response::new(200)
            .with_header("X-Text-Size", "10")
            .with_header("X-More-Data", "true")
            .with_body(&bytes[4..10]);
        assert_eq!(lines(cursor.advance("u", &middle).unwrap()), ["café"]);

        let tail = Response::new(200)
            .with_header("X-Text-Size", bytes.len().to_string())
            .with_header("X-More-Data", "false")
            .with_body(&bytes[10..]);
        assert_eq!(lines(cursor.advance("u", &tail).unwrap()), ["naïve"]);
    }

    #[test]
    fn unchanged_size_is_pending() {
        let mut cursor = ConsoleCursor::default();
        cursor.advance("u", &chunk(4, true, "abc\n")).unwrap();

        assert_eq!(cursor.advance("u", &chunk(4, true, "")).unwrap(), ConsoleChunk::Pending);
        assert_eq!(cursor.offset(), 4);
    }

    #[test]
    fn crlf_is_stripped() {
        let mut cursor = ConsoleCursor::default();
        let chunk = cursor.advance("u", &chunk(5, false, "abc\r\n")).unwrap();
        assert_eq!(lines(chunk), ["abc"]);
    }

    #[test]
    fn missing_more_data_means_finished() {
        let mut cursor = ConsoleCursor::default();
        let response = Response::new(200).with_header("X-Text-Size", "2").with_body("x\n");

        cursor.advance("u", &response).unwrap();

        assert!(!cursor.more_data());
    }

    #[test]
    fn missing_size_is_a_protocol_error() {
        let mut cursor = ConsoleCursor::default();
        let response = Response::new(200).with_header("X-More-Data", "true");

        let err = cursor.advance("u", &response).unwrap_err();

        assert!(matches!(err, Error::ConsoleProtocol { .. }));
    }

    #[test]
    fn malformed_size_is_a_protocol_error() {
        let mut cursor = ConsoleCursor::default();
        let err = cursor
            .advance("u", &Response::new(200).with_header("X-Text-Size", "lots"))
            .unwrap_err();
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    fn shrinking_log_is_a_protocol_error() {
        let mut cursor = ConsoleCursor::default();
        cursor.advance("u", &chunk(10, true, "123456789\n")).unwrap();

        let err = cursor.advance("u", &chunk(5, true, "")).unwrap_err();

        assert!(matches!(err, Error::ConsoleProtocol { .. }));
    }

    #[test]
    fn reset_rewinds() {
        let mut cursor = ConsoleCursor::default();
        cursor.advance("u", &chunk(4, false, "abc\n")).unwrap();
        cursor.reset();
        assert_eq!(cursor, ConsoleCursor::default());
    }

    #[test]
    fn zero_interval_is_non_blocking() {
        let options = ConsoleOptions::blocking(Duration::ZERO);
        assert_eq!(options.poll_interval.filter(|i| !i.is_zero()), None);
    }
}
