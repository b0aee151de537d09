//! Incremental decoder for `text/event-stream` response bodies.
//!
//! Bytes are buffered until a blank-line terminated block is complete, so a
//! chunk boundary can fall anywhere (mid-line, mid-block or inside a UTF-8
//! code point) without changing the decoded frames.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{FrameError, StreamError};

/// Raw response body: byte chunks, or a transport failure message.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, String>> + Send + 'static>>;

/// Event type used when a block carries no `event:` line.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl StreamFrame {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Splits buffered bytes into frames. Create one decoder per stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    scan_from: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every frame completed by it, in order.
    ///
    /// Blocks without a `data:` line are skipped. A block whose payload is not
    /// JSON yields an `Err` in its position; later blocks are unaffected.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Result<StreamFrame, FrameError>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_block_delimiter(&self.buf, self.scan_from) {
            let block: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            self.scan_from = 0;
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        // Everything before this point was checked against both delimiters.
        self.scan_from = self.buf.len().saturating_sub(3);
        frames
    }

    /// Number of buffered bytes that do not yet form a complete block.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Ends the stream, dropping any unterminated trailing block.
    ///
    /// Returns the number of discarded bytes.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        self.scan_from = 0;
        dropped
    }
}

fn find_block_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_block(bytes: &[u8]) -> Option<Result<StreamFrame, FrameError>> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, ""),
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event_type = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let event_type = event_type
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
    let data = data_lines.join("\n");
    Some(
        serde_json::from_str(&data)
            .map(|payload| StreamFrame {
                event_type: event_type.clone(),
                payload,
            })
            .map_err(|e| FrameError::MalformedPayload {
                event_type,
                message: e.to_string(),
            }),
    )
}

/// Turns a response body into a lazy stream of frames.
///
/// `StreamError::Decode` items are informational and the stream continues.
/// `StreamError::Transport` is the final item. After the body ends cleanly
/// any partial trailing block is discarded.
pub fn frame_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<StreamFrame, StreamError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: FrameDecoder,
        pending: VecDeque<Result<StreamFrame, StreamError>>,
        done: bool,
    }

    stream::unfold(
        State {
            bytes_stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for item in state.decoder.push_chunk(&chunk) {
                            state.pending.push_back(item.map_err(StreamError::from));
                        }
                    }
                    Some(Err(message)) => {
                        state.decoder.finish();
                        state.done = true;
                        state.pending.push_back(Err(StreamError::Transport(message)));
                    }
                    None => {
                        let dropped = state.decoder.finish();
                        if dropped > 0 {
                            debug!(
                                event = "sse.trailing_discarded",
                                domain = "sse",
                                dropped_bytes = dropped as u64
                            );
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
}
