//! Stream reader for tmux control mode stdout
//!
//! Turns arbitrarily split byte chunks into complete lines. Bytes are
//! buffered (not chars) so a UTF-8 sequence cut between two reads is
//! reassembled before conversion.
//!
//! tmux writes bytes >= 0x80 of pane output unescaped, and one character can
//! be split across two `%output` lines. Invalid bytes on an `%output` line
//! are therefore re-escaped as `\ooo`, the same form tmux uses for control
//! bytes, and decoded back to the original bytes downstream. Any other line
//! is converted lossily.

use std::fmt::Write;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the line channel between the reader task and the driver.
pub const LINE_CHANNEL_CAPACITY: usize = 1000;

const READ_CHUNK_SIZE: usize = 4096;

const OUTPUT_PREFIX: &[u8] = b"%output ";

/// What the reader task delivers downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One complete line, without its terminator
    Line(String),
    /// End of stream (EOF or read error). Sent exactly once, last.
    Closed,
}

/// Partial-line buffer.
#[derive(Debug, Default)]
pub struct LineBuffer {
    tail: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.tail.extend_from_slice(&rest[..pos]);
            lines.push(take_line(&mut self.tail));
            rest = &rest[pos + 1..];
        }
        self.tail.extend_from_slice(rest);

        lines
    }

    /// Flush an unterminated final line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.tail.is_empty() {
            None
        } else {
            Some(take_line(&mut self.tail))
        }
    }

    /// Number of buffered bytes not yet delivered.
    pub fn pending(&self) -> usize {
        self.tail.len()
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let mut raw = std::mem::take(buf);
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    match String::from_utf8(raw) {
        Ok(line) => line,
        Err(e) if e.as_bytes().starts_with(OUTPUT_PREFIX) => escape_invalid(e.as_bytes()),
        // Replaces invalid UTF-8 with U+FFFD instead of failing the stream
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn escape_invalid(raw: &[u8]) -> String {
    let mut line = String::with_capacity(raw.len() + 8);
    for chunk in raw.utf8_chunks() {
        line.push_str(chunk.valid());
        for byte in chunk.invalid() {
            let _ = write!(line, "\\{:03o}", byte);
        }
    }
    line
}

/// Spawn the task that drains `reader` and feeds lines into `tx`.
pub fn spawn_reader_task<R>(mut reader: R, tx: mpsc::Sender<StreamEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.push(&chunk[..n]) {
                        if tx.send(StreamEvent::Line(line)).await.is_err() {
                            // Driver is gone, nobody left to tell
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "control mode stdout read failed");
                    break;
                }
            }
        }

        if let Some(line) = lines.finish() {
            let _ = tx.send(StreamEvent::Line(line)).await;
        }
        let _ = tx.send(StreamEvent::Closed).await;
        tracing::debug!("control mode stdout closed");
    })
}
