//! Progress multiplexer for streaming endpoints.
//!
//! A streaming endpoint runs its engine call as an [`Operation`] on its own
//! task. The operation reports through one or two [`ChannelWriter`] bridges
//! (progress and, optionally, per-item errors). The multiplexer selects over
//! those bridges, the operation's completion and the client going away, and
//! turns everything into newline-delimited JSON through a
//! [`StreamProtocol`]:
//!
//! ```text
//!   Operation task ──progress──┐
//!                  ──errors────┼──► multiplex ──► NDJSON body ──► client
//!                  ──done──────┘        ▲
//!                                       └── client disconnect
//! ```
//!
//! Ordering guarantees:
//!
//! - events from one bridge keep their write order
//! - messages still buffered when the operation finishes are emitted before
//!   the terminal summary
//! - the summary is the last thing written
//!
//! What a disconnect does to the operation is the endpoint's choice, see
//! [`DisconnectPolicy`].

use crate::idle::IdleTimer;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use podgate_core::ChannelReceiver;
use podgate_core::trace::{CURRENT_REFERENCE_ID, current_reference_id};
use serde::Serialize;
use std::future::Future;
use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Encoded events buffered between the multiplexer and the HTTP body.
const BODY_BUFFER: usize = 16;

/// What happens to an operation whose client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// Keep running to completion; the result is still stored locally.
    Detach,
    /// Cancel the operation's token.
    Cancel,
}

/// A producer running on its own task.
#[derive(Debug)]
pub struct Operation<T> {
    handle: JoinHandle<T>,
    cancel: CancellationToken,
    policy: DisconnectPolicy,
}

impl<T: Send + 'static> Operation<T> {
    /// Spawns `producer` with a fresh cancellation token.
    ///
    /// The producer should own the writers of its bridges so they close when
    /// it returns, on every path. It inherits the caller's tracing span and
    /// request reference id.
    pub fn spawn<F, Fut>(policy: DisconnectPolicy, producer: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let reference_id = current_reference_id();
        let task = CURRENT_REFERENCE_ID.scope(reference_id, producer(cancel.clone()));
        let handle = tokio::spawn(task.in_current_span());
        Self {
            handle,
            cancel,
            policy,
        }
    }

    /// The token the producer was given.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Disconnect behaviour.
    #[must_use]
    pub const fn policy(&self) -> DisconnectPolicy {
        self.policy
    }
}

/// Maps bridge messages and the operation outcome to wire events.
///
/// Returning `None` from a per-message hook suppresses the message.
pub trait StreamProtocol: Send + 'static {
    /// One NDJSON line.
    type Event: Serialize + Send;
    /// What the operation returns.
    type Outcome: Send + 'static;

    /// Translates a progress message.
    fn on_progress(&mut self, chunk: &[u8]) -> Option<Self::Event>;

    /// Translates a per-item error message.
    fn on_error(&mut self, chunk: &[u8]) -> Option<Self::Event>;

    /// Terminal events for a finished operation.
    fn on_complete(&mut self, outcome: Self::Outcome) -> Vec<Self::Event>;
}

/// How a multiplexed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The operation finished and its summary was written.
    Completed,
    /// The client went away first.
    ClientGone,
}

/// Drives one stream to its end, writing encoded lines to `out`.
///
/// Every emitted line touches `idle`, so a long stream keeps the service
/// alive.
///
/// # Panics
///
/// Re-raises a panic from the operation's task. Headers are already on the
/// wire at that point; the panic aborts the body.
pub async fn multiplex<P: StreamProtocol>(
    mut protocol: P,
    mut progress: ChannelReceiver,
    mut errors: Option<ChannelReceiver>,
    operation: Operation<P::Outcome>,
    out: mpsc::Sender<Bytes>,
    idle: Option<IdleTimer>,
) -> StreamEnd {
    let Operation {
        mut handle,
        cancel,
        policy,
    } = operation;
    let sink = Sink { out: &out, idle: idle.as_ref() };
    let mut progress_open = true;
    let mut errors_open = errors.is_some();

    let client_gone = loop {
        tokio::select! {
            biased;
            () = out.closed() => break true,
            chunk = progress.recv(), if progress_open => match chunk {
                Some(chunk) => {
                    if !sink.emit(protocol.on_progress(&chunk)).await {
                        break true;
                    }
                }
                None => progress_open = false,
            },
            chunk = recv(&mut errors), if errors_open => match chunk {
                Some(chunk) => {
                    if !sink.emit(protocol.on_error(&chunk)).await {
                        break true;
                    }
                }
                None => errors_open = false,
            },
            joined = &mut handle => {
                while let Some(chunk) = progress.try_recv() {
                    if !sink.emit(protocol.on_progress(&chunk)).await {
                        return StreamEnd::ClientGone;
                    }
                }
                if let Some(errors) = errors.as_mut() {
                    while let Some(chunk) = errors.try_recv() {
                        if !sink.emit(protocol.on_error(&chunk)).await {
                            return StreamEnd::ClientGone;
                        }
                    }
                }

                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => {
                        tracing::error!("streaming operation panicked, aborting response");
                        std::panic::resume_unwind(err.into_panic());
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "streaming operation was aborted");
                        return StreamEnd::Completed;
                    }
                };
                for event in protocol.on_complete(outcome) {
                    if !sink.emit(Some(event)).await {
                        return StreamEnd::ClientGone;
                    }
                }
                break false;
            }
        }
    };

    if !client_gone {
        return StreamEnd::Completed;
    }

    match policy {
        DisconnectPolicy::Cancel => {
            tracing::debug!("client disconnected, cancelling operation");
            cancel.cancel();
        }
        DisconnectPolicy::Detach => {
            tracing::debug!("client disconnected, operation continues in the background");
        }
    }
    StreamEnd::ClientGone
}

/// Starts `operation` streaming to the client as `application/json` NDJSON.
///
/// The 200 status and headers are committed before the first event.
/// Validation must therefore happen before calling this.
pub fn ndjson_response<P: StreamProtocol>(
    protocol: P,
    progress: ChannelReceiver,
    errors: Option<ChannelReceiver>,
    operation: Operation<P::Outcome>,
    idle: Option<IdleTimer>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(BODY_BUFFER);
    let task = tokio::spawn(
        multiplex(protocol, progress, errors, operation, tx, idle).in_current_span(),
    );

    // The multiplexer's own failure must not look like a clean end of stream.
    let trailer = futures::stream::once(async move {
        match task.await {
            Err(err) if err.is_panic() => Some(Err(io::Error::other("response stream aborted"))),
            _ => None,
        }
    })
    .filter_map(futures::future::ready);

    let body = ReceiverStream::new(rx).map(Ok).chain(trailer);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}

struct Sink<'a> {
    out: &'a mpsc::Sender<Bytes>,
    idle: Option<&'a IdleTimer>,
}

impl Sink<'_> {
    /// Writes one event. Returns false if the client is gone.
    async fn emit<E: Serialize>(&self, event: Option<E>) -> bool {
        let Some(event) = event else {
            return true;
        };
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode stream event");
                return true;
            }
        };
        line.push(b'\n');
        if self.out.send(Bytes::from(line)).await.is_err() {
            return false;
        }
        if let Some(idle) = self.idle {
            idle.touch();
        }
        true
    }
}

async fn recv(receiver: &mut Option<ChannelReceiver>) -> Option<Bytes> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => None,
    }
}

/// Decodes a bridge message as text, dropping one trailing newline.
#[must_use]
pub fn chunk_text(chunk: &[u8]) -> String {
    let text = String::from_utf8_lossy(chunk);
    text.strip_suffix('\n').unwrap_or(&text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use podgate_core::ChannelWriter;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Progress lines become `{"stream"}`, errors `{"error"}`, and the
    /// outcome a `{"done"}` summary.
    struct Lines;

    impl StreamProtocol for Lines {
        type Event = Value;
        type Outcome = u32;

        fn on_progress(&mut self, chunk: &[u8]) -> Option<Value> {
            Some(json!({ "stream": chunk_text(chunk) }))
        }

        fn on_error(&mut self, chunk: &[u8]) -> Option<Value> {
            Some(json!({ "error": chunk_text(chunk) }))
        }

        fn on_complete(&mut self, outcome: u32) -> Vec<Value> {
            vec![json!({ "done": outcome })]
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Bytes>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(line) = rx.recv().await {
            assert_eq!(line.last(), Some(&b'\n'));
            events.push(serde_json::from_slice(&line).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn progress_errors_and_summary_in_order() {
        let (progress_tx, progress_rx) = ChannelWriter::new(1);
        let (errors_tx, errors_rx) = ChannelWriter::new(1);
        let operation = Operation::spawn(DisconnectPolicy::Detach, move |_cancel| async move {
            for i in 0..3 {
                progress_tx.write_str(&format!("step {i}\n")).await.unwrap();
            }
            errors_tx.write_str("item b failed\n").await.unwrap();
            7
        });

        let (tx, rx) = mpsc::channel(4);
        let consumer = tokio::spawn(collect(rx));
        let end = multiplex(Lines, progress_rx, Some(errors_rx), operation, tx, None).await;
        assert_eq!(end, StreamEnd::Completed);

        let events = consumer.await.unwrap();
        assert_eq!(events.len(), 5);
        let streams: Vec<&Value> = events.iter().filter(|e| e.get("stream").is_some()).collect();
        assert_eq!(streams[0]["stream"], "step 0");
        assert_eq!(streams[2]["stream"], "step 2");
        assert!(events.iter().any(|e| e["error"] == "item b failed"));
        assert_eq!(events.last().unwrap(), &json!({ "done": 7 }));
    }

    #[tokio::test]
    async fn buffered_messages_precede_summary() {
        let (progress_tx, progress_rx) = ChannelWriter::new(8);
        // Everything is written before the multiplexer starts reading.
        for i in 0..5 {
            progress_tx.write_str(&format!("{i}")).await.unwrap();
        }
        let operation = Operation::spawn(DisconnectPolicy::Detach, move |_cancel| async move {
            drop(progress_tx);
            1
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx, rx) = mpsc::channel(16);
        multiplex(Lines, progress_rx, None, operation, tx, None).await;
        let events = collect(rx).await;
        assert_eq!(events.len(), 6);
        assert_eq!(events[4]["stream"], "4");
        assert_eq!(events[5]["done"], 1);
    }

    #[tokio::test]
    async fn disconnect_cancels_when_requested() {
        let (progress_tx, progress_rx) = ChannelWriter::new(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let operation = Operation::spawn(DisconnectPolicy::Cancel, move |cancel| async move {
            let _ = progress_tx.write_str("first").await;
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            0
        });
        let token = operation.cancel_token().clone();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let end = multiplex(Lines, progress_rx, None, operation, tx, None).await;

        assert_eq!(end, StreamEnd::ClientGone);
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !cancelled.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("producer should observe cancellation");
    }

    #[tokio::test]
    async fn disconnect_detaches_when_requested() {
        let (progress_tx, progress_rx) = ChannelWriter::new(1);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let operation = Operation::spawn(DisconnectPolicy::Detach, move |cancel| async move {
            // Nobody reads these once the client is gone.
            for i in 0..10 {
                let _ = progress_tx.write_str(&format!("{i}")).await;
            }
            let _ = done_tx.send(cancel.is_cancelled());
            0
        });
        let token = operation.cancel_token().clone();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(
            multiplex(Lines, progress_rx, None, operation, tx, None).await,
            StreamEnd::ClientGone
        );

        let was_cancelled = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!was_cancelled);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn suppressed_progress_is_not_written() {
        struct Quiet;
        impl StreamProtocol for Quiet {
            type Event = Value;
            type Outcome = ();
            fn on_progress(&mut self, _chunk: &[u8]) -> Option<Value> {
                None
            }
            fn on_error(&mut self, chunk: &[u8]) -> Option<Value> {
                Some(json!({ "error": chunk_text(chunk) }))
            }
            fn on_complete(&mut self, (): ()) -> Vec<Value> {
                vec![json!({ "ok": true })]
            }
        }

        let (progress_tx, progress_rx) = ChannelWriter::new(1);
        let operation = Operation::spawn(DisconnectPolicy::Detach, move |_| async move {
            progress_tx.write_str("noise").await.unwrap();
        });
        let (tx, rx) = mpsc::channel(4);
        multiplex(Quiet, progress_rx, None, operation, tx, None).await;
        assert_eq!(collect(rx).await, vec![json!({ "ok": true })]);
    }

    #[tokio::test]
    async fn response_body_is_ndjson() {
        use http_body_util::BodyExt;

        let (progress_tx, progress_rx) = ChannelWriter::new(0);
        let operation = Operation::spawn(DisconnectPolicy::Detach, move |_| async move {
            progress_tx.write_str("hello\n").await.unwrap();
            2
        });

        let response = ndjson_response(Lines, progress_rx, None, operation, None);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text, "{\"stream\":\"hello\"}\n{\"done\":2}\n");
    }

    #[tokio::test]
    async fn producer_panic_aborts_body() {
        use http_body_util::BodyExt;

        async fn explode(progress: ChannelWriter) -> u32 {
            progress.write_str("partial").await.unwrap();
            panic!("producer exploded")
        }

        let (progress_tx, progress_rx) = ChannelWriter::new(1);
        let operation = Operation::spawn(DisconnectPolicy::Detach, move |_| explode(progress_tx));

        let response = ndjson_response(Lines, progress_rx, None, operation, None);
        assert!(response.into_body().collect().await.is_err());
    }

    #[tokio::test]
    async fn producer_inherits_reference_id() {
        let seen = CURRENT_REFERENCE_ID
            .scope("req-123".to_string(), async {
                let operation = Operation::spawn(DisconnectPolicy::Detach, |_| async {
                    current_reference_id()
                });
                operation.handle.await.unwrap()
            })
            .await;
        assert_eq!(seen, "req-123");

        let outside = Operation::spawn(DisconnectPolicy::Detach, |_| async { current_reference_id() });
        assert_eq!(outside.handle.await.unwrap(), "");
    }

    #[test]
    fn chunk_text_strips_one_newline() {
        assert_eq!(chunk_text(b"line\n"), "line");
        assert_eq!(chunk_text(b"line\n\n"), "line\n");
        assert_eq!(chunk_text(b"plain"), "plain");
    }
}
