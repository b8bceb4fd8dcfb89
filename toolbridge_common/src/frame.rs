//! Incremental decoding of newline-delimited JSON frames.
//!
//! Child processes speak JSON-RPC over stdout, one JSON value per line, but
//! many of them also print human-readable log lines on the very same stream.
//! [`FrameDecoder`] turns an arbitrary sequence of byte chunks into the
//! ordered sequence of JSON values it contains:
//!
//! * Bytes are buffered until a `\n` arrives; the trailing partial line is
//!   carried over to the next chunk and never emitted on its own.
//! * A complete line is a frame candidate only if, after trimming, it starts
//!   with `{` or `[`. Everything else is diagnostic output and is skipped.
//! * A candidate that fails to parse is dropped with a warning. It never
//!   stops the stream.
//!
//! The decoder works on bytes rather than text so that a multi-byte UTF-8
//! character split across two chunks is reassembled before parsing.
//!
//! It implements [`tokio_util::codec::Decoder`], so a child's stdout can be
//! wrapped in a `FramedRead`. [`FrameDecoder::push`] feeds chunks by hand,
//! which is how the chunk-boundary behaviour is tested.

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

/// Lines longer than this are discarded instead of buffered without bound.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Errors surfaced by [`FrameDecoder`] when used as a codec.
///
/// Decoding itself never fails; only the underlying reader can.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error while reading frames: {0}")]
    Io(#[from] std::io::Error),
}

/// Counters describing what the decoder has seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// JSON values emitted.
    pub frames: u64,
    /// Lines skipped because they did not look like JSON.
    pub skipped_lines: u64,
    /// Candidate lines that failed to parse.
    pub malformed: u64,
    /// Lines dropped for exceeding the maximum frame length.
    pub oversized: u64,
}

/// Newline-delimited JSON decoder tolerant of interleaved log output.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Carry-over buffer used by [`FrameDecoder::push`].
    buffer: BytesMut,
    /// Offset up to which the current buffer has already been searched for `\n`.
    next_index: usize,
    max_length: usize,
    /// True while skipping the remainder of an oversized line.
    discarding: bool,
    stats: FrameStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            next_index: 0,
            max_length,
            discarding: false,
            stats: FrameStats::default(),
        }
    }

    /// Feed one chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.decode(&mut buffer) {
            frames.push(frame);
        }

        self.buffer = buffer;
        frames
    }

    /// Number of bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Value> {
        let line = raw.trim_ascii();
        if line.is_empty() {
            return None;
        }

        // Only lines opening an object or array can be protocol frames.
        if !matches!(line[0], b'{' | b'[') {
            self.stats.skipped_lines += 1;
            trace!(line = %String::from_utf8_lossy(line), "Skipping non-JSON line");
            return None;
        }

        match serde_json::from_slice::<Value>(line) {
            Ok(value) => {
                self.stats.frames += 1;
                Some(value)
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(line),
                    "Dropping malformed frame"
                );
                None
            }
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        loop {
            let search_from = self.next_index.min(src.len());
            let newline = src[search_from..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if self.discarding {
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_length {
                    self.stats.oversized += 1;
                    warn!(
                        buffered = src.len(),
                        max = self.max_length,
                        "Frame exceeds maximum length; discarding until next newline"
                    );
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let line_end = search_from + offset;
            let line = src.split_to(line_end + 1);
            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            if line_end > self.max_length {
                self.stats.oversized += 1;
                warn!(
                    length = line_end,
                    max = self.max_length,
                    "Dropping oversized frame"
                );
                continue;
            }

            if let Some(value) = self.decode_line(&line[..line_end]) {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            debug!(
                bytes = src.len(),
                "Stream ended inside a line; discarding incomplete trailing data"
            );
            src.clear();
        }
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}
