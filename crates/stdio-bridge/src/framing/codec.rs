//! Newline-delimited JSON codec for subprocess stdio.
//!
//! Works over any AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.
//! Decoding is tolerant: stdio servers often print diagnostics on stdout, so a
//! line that is not valid JSON is dropped instead of failing the stream.

use std::io;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::stats::RelayStats;

/// Codec that splits on `\n` and parses each non-empty line as JSON.
///
/// A partial line at the end of the buffer stays buffered until its
/// terminator arrives, so chunk boundaries never affect the decoded sequence.
/// Lines are split as raw bytes rather than through `LinesCodec`: a line that
/// is not UTF-8 is dropped like any other non-JSON line instead of ending the
/// stream.
#[derive(Debug, Default, Clone)]
pub struct LineJsonCodec {
    /// Bytes of the buffer already scanned without finding a terminator.
    scanned: usize,
    stats: Option<Arc<RelayStats>>,
}

impl LineJsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count discarded lines in `stats`.
    pub fn with_stats(stats: Arc<RelayStats>) -> Self {
        Self {
            scanned: 0,
            stats: Some(stats),
        }
    }

    fn parse_line(&self, line: &[u8]) -> Option<Value> {
        // trim_ascii also drops the `\r` of a CRLF terminator
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice(line) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(
                    line_bytes = line.len(),
                    error = %e,
                    line = %String::from_utf8_lossy(line),
                    "Discarding non-JSON output line"
                );
                if let Some(stats) = &self.stats {
                    stats.record_unparseable_line();
                }
                None
            }
        }
    }
}

impl Decoder for LineJsonCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = src.len();
                return Ok(None);
            };
            let newline = self.scanned + offset;
            self.scanned = 0;

            let line = src.split_to(newline + 1);
            if let Some(value) = self.parse_line(&line[..newline]) {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated final line: the child exited without a trailing newline.
        let tail = src.split();
        self.scanned = 0;
        Ok(self.parse_line(&tail))
    }
}

impl Encoder<&Value> for LineJsonCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
