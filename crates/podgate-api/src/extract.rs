//! Extractors that reject with the API's JSON error model.

use crate::dispatch::RequestForm;
use crate::error::ApiError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Json, Query, Request};
use axum::http::request::Parts;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;

/// Typed query parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|e: QueryRejection| {
                ApiError::BadRequest(format!(
                    "failed to parse query parameters for {}: {}",
                    parts.uri.path(),
                    e.body_text()
                ))
            })
    }
}

/// JSON request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|e: JsonRejection| {
                ApiError::BadRequest(format!("decode request body: {}", e.body_text()))
            })
    }
}

/// The form parsed by the dispatch middleware, or a fresh parse of the query
/// string when the router is used without it.
impl<S> FromRequestParts<S> for RequestForm
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(form) = parts.extensions.get::<Self>() {
            return Ok(form.clone());
        }
        parts.uri.query().map_or_else(
            || Ok(Self::default()),
            |query| {
                Self::parse(query)
                    .map_err(|e| ApiError::BadRequest(format!("failed to parse query string: {e}")))
            },
        )
    }
}

/// Deserializes a boolean query parameter, accepting `1`/`0` as well as
/// `true`/`false`.
pub fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_bool(&raw).ok_or_else(|| de::Error::custom(format!("invalid boolean {raw:?}")))
}

/// Optional variant of [`flexible_bool`].
pub fn flexible_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_bool(&raw)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid boolean {raw:?}"))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" => Some(true),
        "" | "0" | "false" | "f" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Flags {
        #[serde(default, deserialize_with = "flexible_bool")]
        all: bool,
        #[serde(default, deserialize_with = "flexible_opt_bool")]
        tls_verify: Option<bool>,
    }

    #[test]
    fn numeric_and_word_booleans() {
        let flags: Flags = serde_urlencoded::from_str("all=1&tls_verify=false").unwrap();
        assert!(flags.all);
        assert_eq!(flags.tls_verify, Some(false));

        let flags: Flags = serde_urlencoded::from_str("all=true").unwrap();
        assert!(flags.all);
        assert_eq!(flags.tls_verify, None);
    }

    #[test]
    fn garbage_boolean_is_rejected() {
        assert!(serde_urlencoded::from_str::<Flags>("all=maybe").is_err());
    }
}
