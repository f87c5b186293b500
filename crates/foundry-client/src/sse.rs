//! # SSE framing
//!
//! Turns a chunked byte stream into complete server-sent-event messages:
//! - Line buffering across chunk boundaries (`\n` or `\r\n`)
//! - `data:` lines accumulated until a blank line dispatches the message
//! - Comments (`:`) and other fields (`event:`, `id:`, `retry:`) ignored
//! - A read error is yielded once as [`ClientError::Transport`], then the
//!   stream ends
//! - So is a line longer than [`MAX_LINE_BYTES`], so a misbehaving server
//!   gets reconnected instead of filling memory

use std::fmt::Display;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

use foundry_core::ClientError;

/// Longest line accepted before the stream is treated as broken.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

struct SseState<S> {
    inner: Pin<Box<S>>,
    buffer: BytesMut,
    data: Vec<String>,
    max_line: usize,
    done: bool,
}

impl<S> SseState<S> {
    fn take_message(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let message = self.data.join("\n");
        self.data.clear();
        Some(message)
    }

    fn push_line(&mut self, line: &str) {
        if let Some(data) = extract_sse_data(line) {
            self.data.push(data.to_string());
        }
    }
}

/// Yield the data payload of each complete SSE message in `byte_stream`.
pub fn sse_messages<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, ClientError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    sse_messages_with_limit(byte_stream, MAX_LINE_BYTES)
}

fn sse_messages_with_limit<S, E>(
    byte_stream: S,
    max_line: usize,
) -> impl Stream<Item = Result<String, ClientError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        inner: Box::pin(byte_stream),
        buffer: BytesMut::with_capacity(8192),
        data: Vec::new(),
        max_line,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            if let Some(newline_pos) = state.buffer.iter().position(|&b| b == b'\n') {
                let mut line_bytes = state.buffer.split_to(newline_pos + 1);
                line_bytes.truncate(newline_pos);
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.truncate(line_bytes.len() - 1);
                }

                let Ok(line) = std::str::from_utf8(&line_bytes) else {
                    warn!("skipping SSE line with invalid UTF-8");
                    continue;
                };

                if line.is_empty() {
                    if let Some(message) = state.take_message() {
                        return Some((Ok(message), state));
                    }
                } else {
                    state.push_line(line);
                }
                continue;
            }

            if state.buffer.len() > state.max_line {
                state.done = true;
                state.buffer.clear();
                let err = ClientError::Transport(format!(
                    "SSE line exceeds {} bytes without a newline",
                    state.max_line
                ));
                return Some((Err(err), state));
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(ClientError::Transport(e.to_string())), state));
                }
                None => {
                    state.done = true;
                    // flush an unterminated final message
                    if !state.buffer.is_empty() {
                        let rest = std::mem::take(&mut state.buffer);
                        if let Ok(line) = std::str::from_utf8(&rest) {
                            state.push_line(line.trim_end_matches(['\r', '\n']));
                        }
                    }
                    return state.take_message().map(|message| (Ok(message), state));
                }
            }
        }
    })
}

/// Data payload of an SSE line, or `None` for comments and non-data fields.
fn extract_sse_data(line: &str) -> Option<&str> {
    if line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}
