//! Byte-writer-to-channel bridge.
//!
//! A [`ChannelWriter`] lets a producer (usually a long-running engine call on
//! its own task) hand discrete chunks of output to a consumer (usually the
//! progress multiplexer writing an HTTP body). Every `write` becomes exactly
//! one message; the caller's buffer is copied and never retained.
//!
//! The channel capacity is the backpressure knob: with a capacity of one the
//! producer can never run more than a single message ahead of the consumer.
//!
//! ```text
//! producer ──write()──► [ bounded mpsc ] ──recv()──► consumer
//!                 close() / drop ──┘
//! ```

use bytes::Bytes;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by [`ChannelWriter::write`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The writer was closed, or the receiving side went away.
    #[error("channel writer is closed")]
    Closed,
}

/// Writer half of a streaming bridge.
///
/// Concurrent writers are serialized internally, so messages from a single
/// writer are delivered in call order.
#[derive(Debug)]
pub struct ChannelWriter {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    write_lock: tokio::sync::Mutex<()>,
}

/// Receiving half of a streaming bridge. There is exactly one per writer.
#[derive(Debug)]
pub struct ChannelReceiver {
    inner: mpsc::Receiver<Bytes>,
}

impl ChannelWriter {
    /// Creates a bridge whose channel buffers up to `capacity` messages.
    ///
    /// A capacity of zero is treated as one: the closest a bounded tokio
    /// channel gets to a rendezvous.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, ChannelReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Self {
            sender: Mutex::new(Some(tx)),
            write_lock: tokio::sync::Mutex::new(()),
        };
        (writer, ChannelReceiver { inner: rx })
    }

    /// Enqueues a copy of `buf` as one message and returns its length.
    ///
    /// Waits for channel capacity when the consumer is behind.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the writer was closed or the
    /// receiver has been dropped.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
        let _serial = self.write_lock.lock().await;
        let sender = self.current_sender().ok_or(ChannelError::Closed)?;
        sender
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| ChannelError::Closed)?;
        Ok(buf.len())
    }

    /// Convenience wrapper around [`write`](Self::write) for text.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub async fn write_str(&self, text: &str) -> Result<usize, ChannelError> {
        self.write(text.as_bytes()).await
    }

    /// Closes the writer. Safe to call more than once.
    ///
    /// Writes already waiting for capacity are still delivered; the receiver
    /// observes end-of-stream after them.
    pub fn close(&self) {
        let taken = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(taken);
    }

    /// Returns true once [`close`](Self::close) has been called or the
    /// receiver is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(mpsc::Sender::is_closed)
    }

    fn current_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChannelReceiver {
    /// Receives the next message, or `None` once the writer is closed and
    /// every buffered message has been consumed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inner.recv().await
    }

    /// Returns a buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.inner.try_recv().ok()
    }
}
