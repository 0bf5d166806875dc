//! Task-local request correlation id.
//!
//! The API dispatch middleware sets [`CURRENT_REFERENCE_ID`] for the duration
//! of a request, so engine code can tag its own log lines with the id of the
//! HTTP request that triggered it without threading it through every call.

tokio::task_local! {
    /// Task-local reference id. Set by the HTTP middleware, read by engines.
    pub static CURRENT_REFERENCE_ID: String;
}

/// Returns the current reference id, or an empty string outside a request.
pub fn current_reference_id() -> String {
    CURRENT_REFERENCE_ID
        .try_with(Clone::clone)
        .unwrap_or_default()
}
