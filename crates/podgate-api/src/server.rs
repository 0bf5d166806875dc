//! API server lifecycle.
//!
//! ```text
//! new() ──► serve() ──► shutdown requested ──► drain ──► stopped
//!            │  ▲            ▲     ▲     ▲
//!            │  │            │     │     └─ SIGINT / SIGTERM
//!            │  │            │     └─ idle window elapsed
//!            │  │            └─ ServerHandle::shutdown()
//!            └──┴─ accept loop, one task per connection
//! ```
//!
//! Shutdown stops accepting, asks every connection to finish its in-flight
//! request, and gives them up to the write timeout before aborting.
//! [`ServerHandle::close`] skips the drain.

use crate::dispatch::{DispatchState, dispatch};
use crate::error::{ApiError, Result};
use crate::idle::IdleTimer;
use crate::listener::{ApiListener, ApiStream};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use podgate_core::ServiceConfig;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;

/// Back-off after an accept error the process can recover from.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Quiet period after which the server shuts itself down. Zero disables
    /// idle shutdown.
    pub idle_timeout: Duration,
    /// Time allowed for a client to send the request head.
    pub header_read_timeout: Duration,
    /// Time allowed for reading a request body.
    pub read_timeout: Duration,
    /// Drain budget for in-flight responses during graceful shutdown.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for ServerConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            header_read_timeout: config.header_read_timeout(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Remote control for a running [`ApiServer`].
#[derive(Debug, Clone, Default)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl ServerHandle {
    /// Requests a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stops immediately, dropping in-flight connections.
    pub fn close(&self) {
        self.abort.cancel();
        self.shutdown.cancel();
    }

    /// Returns true once a shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// HTTP server for the management API.
pub struct ApiServer {
    listener: ApiListener,
    app: Router,
    config: ServerConfig,
    handle: ServerHandle,
    idle: Option<IdleTimer>,
    idle_expired: CancellationToken,
    handle_signals: bool,
}

impl ApiServer {
    /// Wraps `router` in the dispatch middleware and arms the idle timer.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(listener: ApiListener, router: Router, config: ServerConfig) -> Self {
        let idle_expired = CancellationToken::new();
        let idle = IdleTimer::start(config.idle_timeout, idle_expired.clone());

        let app = router
            .layer(RequestBodyTimeoutLayer::new(config.read_timeout))
            .layer(axum::middleware::from_fn_with_state(
                DispatchState { idle: idle.clone() },
                dispatch,
            ))
            .layer(TraceLayer::new_for_http());

        Self {
            listener,
            app,
            config,
            handle: ServerHandle::default(),
            idle,
            idle_expired,
            handle_signals: true,
        }
    }

    /// Enables or disables shutdown on SIGINT and SIGTERM (on by default).
    #[must_use]
    pub const fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Returns a handle that can stop the server from another task.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Returns the address being served.
    #[must_use]
    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    /// Returns the idle timer, if idle shutdown is enabled.
    #[must_use]
    pub const fn idle_timer(&self) -> Option<&IdleTimer> {
        self.idle.as_ref()
    }

    /// Serves until shut down, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting connections fails unrecoverably.
    pub async fn serve(self) -> Result<()> {
        let Self {
            listener,
            app,
            config,
            handle,
            idle,
            idle_expired,
            handle_signals,
        } = self;

        tracing::info!(
            addr = %listener.local_addr(),
            idle_timeout = ?config.idle_timeout,
            "API service listening"
        );

        let tracker = TaskTracker::new();
        let signal = shutdown_signal(handle_signals);
        tokio::pin!(signal);

        let result = loop {
            tokio::select! {
                biased;
                () = handle.shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                () = idle_expired.cancelled() => break Ok(()),
                () = &mut signal => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(stream) => spawn_connection(&tracker, stream, app.clone(), &config, &handle),
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::warn!(error = %err, "accept failed, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept failed");
                        break Err(ApiError::Io(err));
                    }
                },
            }
        };

        // Connections watch the shutdown token to switch to graceful mode.
        handle.shutdown.cancel();
        if let Some(idle) = &idle {
            idle.stop();
        }
        drop(listener);

        tracker.close();
        tracing::debug!(connections = tracker.len(), "draining connections");
        if tokio::time::timeout(config.write_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                write_timeout = ?config.write_timeout,
                "in-flight requests did not finish in time, aborting"
            );
            handle.abort.cancel();
            tracker.wait().await;
        }

        tracing::info!("API service stopped");
        result
    }
}

fn spawn_connection(
    tracker: &TaskTracker,
    stream: ApiStream,
    app: Router,
    config: &ServerConfig,
    handle: &ServerHandle,
) {
    let header_read_timeout = config.header_read_timeout;
    let shutdown = handle.shutdown.clone();
    let abort = handle.abort.clone();

    tracker.spawn(async move {
        let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
            app.clone().call(request)
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout);
        let conn = builder
            .serve_connection(TokioIo::new(stream), hyper_service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            () = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                tokio::select! {
                    result = conn.as_mut() => result,
                    () = abort.cancelled() => return,
                }
            }
        };

        if let Err(err) = result {
            let err_str = err.to_string().to_lowercase();
            if !err_str.contains("shutting down")
                && !err_str.contains("connection reset")
                && !err_str.contains("broken pipe")
            {
                tracing::debug!("error serving connection: {}", err);
            }
        }
    });
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    ) || matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM))
}

async fn shutdown_signal(enabled: bool) {
    if !enabled {
        std::future::pending::<()>().await;
    }

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_service_settings() {
        let service = ServiceConfig {
            idle_timeout_secs: 0,
            write_timeout_secs: 30,
            ..ServiceConfig::default()
        };
        let config = ServerConfig::from(&service);
        assert_eq!(config.idle_timeout, Duration::ZERO);
        assert_eq!(config.write_timeout, Duration::from_secs(30));
        assert_eq!(config.header_read_timeout, Duration::from_secs(5));
    }

    #[test]
    fn handle_shutdown_is_idempotent() {
        let handle = ServerHandle::default();
        assert!(!handle.is_shutting_down());
        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shutting_down());
    }

    #[test]
    fn close_implies_shutdown() {
        let handle = ServerHandle::default();
        handle.close();
        assert!(handle.is_shutting_down());
        assert!(handle.abort.is_cancelled());
    }

    #[test]
    fn descriptor_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
