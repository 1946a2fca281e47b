//! Server-Sent Events (SSE) parsing.
//!
//! The parser works line by line over raw bytes, so UTF-8 sequences and
//! `\r\n` pairs split across network chunks are reassembled before decoding.

use futures_core::Stream;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tether_types::LinkError;

/// A single SSE event parsed from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental SSE parser that processes bytes into events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return any events it completed.
    ///
    /// Each byte is scanned for a line break once, however many chunks a long
    /// line arrives in, and consumed lines are compacted away once per call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        let mut line_start = 0;
        let mut scan_from = self.scanned;
        while let Some(offset) = buffer[scan_from..].iter().position(|&b| b == b'\n') {
            let line_end = scan_from + offset;
            let line = String::from_utf8_lossy(&buffer[line_start..line_end]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
            } else {
                self.process_line(line);
            }

            line_start = line_end + 1;
            scan_from = line_start;
        }

        buffer.drain(..line_start);
        self.scanned = buffer.len();
        self.buffer = buffer;
        events
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {} // id, retry and unknown fields are not used by the host
        }
    }

    fn flush(&mut self) -> Option<SseEvent> {
        let event_type = self.event_type.take();
        if self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event_type,
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

pin_project! {
    /// An async stream of [`SseEvent`]s read from an HTTP response body.
    pub struct EventStream {
        #[pin]
        inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
        parser: SseParser,
        ready: VecDeque<SseEvent>,
    }
}

impl EventStream {
    /// Create a new EventStream from a reqwest byte stream.
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            ready: VecDeque::new(),
        }
    }
}

impl Stream for EventStream {
    type Item = Result<SseEvent, LinkError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.ready.extend(this.parser.feed(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(LinkError::Network(e.to_string()))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
