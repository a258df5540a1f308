//! Incremental decoding of `data: <json>` streaming bodies.
//!
//! Chunk boundaries are arbitrary: a chunk may end inside a payload, inside
//! the `data:` prefix or inside a multi-byte character. The decoder buffers
//! raw bytes and only hands out complete lines, so none of that is visible to
//! callers.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;

use crate::{BoxError, Error, Result};

const DATA_PREFIX: &[u8] = b"data:";
const DONE_SENTINEL: &[u8] = b"[DONE]";

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Leading bytes of `buffer` already known to hold no newline.
    scanned: usize,
    frames: VecDeque<Bytes>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and split off every complete line.
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let idx = self.scanned + offset;
            let mut line = self.buffer.split_to(idx + 1).freeze();
            line.truncate(idx);
            self.scanned = 0;
            self.push_line(line);
        }
        self.scanned = self.buffer.len();
    }

    /// End of body: whatever is still buffered is treated as a final line.
    pub fn close(&mut self) {
        if !self.buffer.is_empty() {
            let line = self.buffer.split().freeze();
            self.scanned = 0;
            self.push_line(line);
        }
    }

    /// The next complete frame payload, in arrival order.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    /// Bytes received but not yet part of a complete line.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer
    }

    fn push_line(&mut self, line: Bytes) {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            // Comments, `event:`/`id:` fields and blank separators.
            return;
        };
        let payload = payload.trim_ascii();
        if payload.is_empty() || payload == DONE_SENTINEL {
            return;
        }
        self.frames.push_back(line.slice_ref(payload));
    }
}

pin_project! {
    /// Frames of a streaming body, each decoded as JSON into `T`.
    pub struct FrameStream<S, T> {
        #[pin]
        body: S,
        decoder: FrameDecoder,
        finished: bool,
        _frame: PhantomData<fn() -> T>,
    }
}

impl<S, T> FrameStream<S, T> {
    pub fn new(body: S) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            finished: false,
            _frame: PhantomData,
        }
    }
}

impl<S, T> Stream for FrameStream<S, T>
where
    S: Stream<Item = core::result::Result<Bytes, BoxError>>,
    T: DeserializeOwned,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = this.decoder.next_frame() {
                let parsed = serde_json::from_slice(&frame).map_err(|source| Error::Decode {
                    what: "stream frame",
                    source,
                });
                return Poll::Ready(Some(parsed));
            }
            if *this.finished {
                return Poll::Ready(None);
            }
            match ready!(this.body.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => this.decoder.write(&chunk),
                Some(Err(e)) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(Error::Transport(e))));
                }
                None => {
                    *this.finished = true;
                    this.decoder.close();
                }
            }
        }
    }
}
