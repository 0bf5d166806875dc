//! Request dispatch middleware.
//!
//! Wraps every handler invocation:
//!
//! - records activity on the idle timer, on entry and once a response exists
//! - assigns the `X-Reference-Id` correlation id (reusing a caller-supplied
//!   one), exposes it to handlers and the engine, and echoes it back
//! - parses the query string once into a [`RequestForm`]
//! - converts a handler panic into a logged 500 so one bad request cannot
//!   take the service down
//!
//! A panic while a streaming body is already being written cannot be turned
//! into a response anymore; the streaming layer aborts the connection
//! instead.

use crate::error::ErrorModel;
use crate::idle::IdleTimer;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use podgate_core::trace::CURRENT_REFERENCE_ID;
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use tracing::Instrument;

/// Header carrying the per-request correlation id.
pub const REFERENCE_ID_HEADER: &str = "X-Reference-Id";

/// Correlation id stored in request extensions.
#[derive(Debug, Clone)]
pub struct ReferenceId(pub String);

/// Decoded query parameters, in request order.
///
/// Repeated keys are kept, so list-valued parameters
/// (`containers=a&containers=b`) survive.
#[derive(Debug, Clone, Default)]
pub struct RequestForm(pub Vec<(String, String)>);

impl RequestForm {
    /// Parses a raw query string.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is not valid form encoding.
    pub fn parse(query: &str) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(query).map(Self)
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `key`, in order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns true if `key` appears at all.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }
}

/// State for [`dispatch`].
#[derive(Debug, Clone, Default)]
pub struct DispatchState {
    /// Idle timer to touch; `None` when idle shutdown is disabled.
    pub idle: Option<IdleTimer>,
}

/// Axum middleware wrapping every route.
pub async fn dispatch(
    State(state): State<DispatchState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(idle) = &state.idle {
        idle.touch();
        request.extensions_mut().insert(idle.clone());
    }

    let reference_id = request
        .headers()
        .get(REFERENCE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

    let span = tracing::info_span!(
        "request",
        reference_id = %reference_id,
        method = %request.method(),
        uri = %request.uri(),
    );

    let form = match request.uri().query() {
        Some(query) => RequestForm::parse(query).unwrap_or_else(|e| {
            span.in_scope(|| tracing::warn!(error = %e, "failed to parse query string"));
            RequestForm::default()
        }),
        None => RequestForm::default(),
    };
    request.extensions_mut().insert(form);
    request
        .extensions_mut()
        .insert(ReferenceId(reference_id.clone()));
    if let Ok(value) = HeaderValue::from_str(&reference_id) {
        request.headers_mut().insert(REFERENCE_ID_HEADER, value);
    }

    let handler = CURRENT_REFERENCE_ID.scope(reference_id.clone(), next.run(request));
    let outcome = AssertUnwindSafe(handler)
        .catch_unwind()
        .instrument(span.clone())
        .await;

    let mut response = match outcome {
        Ok(response) => response,
        Err(panic) => {
            span.in_scope(|| {
                tracing::error!(
                    panic = %panic_message(panic.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "handler panicked"
                );
            });
            panic_response()
        }
    };

    if let Some(idle) = &state.idle {
        idle.touch();
    }
    if let Ok(value) = HeaderValue::from_str(&reference_id) {
        response.headers_mut().insert(REFERENCE_ID_HEADER, value);
    }
    response
}

fn panic_response() -> Response {
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    let body = ErrorModel::new(
        status,
        "internal server error",
        "the request handler failed unexpectedly",
    );
    (status, axum::Json(body)).into_response()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
