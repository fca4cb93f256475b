//! Lazy NDJSON decoding of streaming response bodies.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Error;

/// Decodes a byte stream of newline-delimited JSON into typed records.
///
/// One forward pass over the response body, splitting on `\n`. Blank lines
/// are skipped silently; a line that fails to parse (including a truncated
/// trailing fragment) is skipped with a diagnostic and never aborts the
/// stream. Records are yielded in arrival order as the caller polls; nothing
/// is decoded ahead of consumption. A transport read error ends the stream
/// after being yielded as an `Err` item.
pub struct NdjsonStream<S, T> {
    inner: S,
    buffer: Vec<u8>,
    done: bool,
    _record: PhantomData<fn() -> T>,
}

impl<S, T> NdjsonStream<S, T> {
    /// Wrap a raw byte stream. Decoding starts from the first byte; the
    /// stream is single-use and not restartable.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            done: false,
            _record: PhantomData,
        }
    }
}

impl<S, T> NdjsonStream<S, T>
where
    T: DeserializeOwned,
{
    /// Decode one frame, skipping blank and malformed lines.
    fn decode_line(line: &[u8]) -> Option<T> {
        let line = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(e) => {
                debug!(error = %e, "skipping non-utf8 stream frame");
                return None;
            }
        };
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "skipping malformed stream frame");
                None
            }
        }
    }
}

impl<S, E, T> Stream for NdjsonStream<S, T>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
    T: DeserializeOwned,
{
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            // Drain complete lines from the buffer before reading more bytes.
            if let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
                if let Some(value) = Self::decode_line(&line) {
                    return Poll::Ready(Some(Ok(value)));
                }
                continue;
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(Error::Request(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    // A final line without a trailing newline is still a frame.
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.is_empty()
                        && let Some(value) = Self::decode_line(&rest)
                    {
                        return Poll::Ready(Some(Ok(value)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
