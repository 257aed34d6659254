//! Output streams the scroll engine writes into.
//!
//! A sink has one writer and receives exactly one terminal call: `end` after a completed
//! (possibly truncated) response, or `abort` when the query failed.

use std::io::Write;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::query_ast::errors::QueryAstError;

pub trait OutputSink: Send {
    fn write_chunk(&mut self, chunk: &str) -> std::io::Result<()>;
    fn end(&mut self) -> std::io::Result<()>;
    fn abort(&mut self, error: &QueryAstError);
}

/// Writes chunks straight into any `std::io::Write` (stdout, a file, a buffer).
pub struct WriterSink<W: Write + Send> {
    inner: W,
    bytes_written: u64,
    finished: bool,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, bytes_written: 0, finished: false }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn write_chunk(&mut self, chunk: &str) -> std::io::Result<()> {
        self.inner.write_all(chunk.as_bytes())?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    fn end(&mut self) -> std::io::Result<()> {
        self.finished = true;
        debug!("stream ended after {} bytes", self.bytes_written);
        self.inner.flush()
    }

    fn abort(&mut self, error: &QueryAstError) {
        self.finished = true;
        warn!("stream aborted after {} bytes: {}", self.bytes_written, error);
        let _ = self.inner.flush();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    End,
    Error(String),
}

/// Forwards chunks to an async consumer (e.g. an HTTP response body).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: StreamEvent) -> std::io::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream receiver dropped"))
    }
}

impl OutputSink for ChannelSink {
    fn write_chunk(&mut self, chunk: &str) -> std::io::Result<()> {
        self.send(StreamEvent::Chunk(chunk.to_string()))
    }

    fn end(&mut self) -> std::io::Result<()> {
        self.send(StreamEvent::End)
    }

    fn abort(&mut self, error: &QueryAstError) {
        if self.send(StreamEvent::Error(error.to_string())).is_err() {
            debug!("stream receiver gone before error could be delivered: {}", error);
        }
    }
}
