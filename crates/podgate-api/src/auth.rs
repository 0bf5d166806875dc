//! Registry credentials carried in request headers.
//!
//! Clients pass credentials in one of two headers, both base64url-encoded
//! JSON:
//!
//! - `X-Registry-Config`: a map of registry to auth config, possibly
//!   repeated. The `""` key holds default credentials; a `registry` query
//!   parameter picks a more specific entry.
//! - `X-Registry-Auth`: either such a map or a single auth config.
//!
//! Maps are materialized as a temporary `auth.json` that lives as long as the
//! returned [`Credentials`]. Streaming handlers move the credentials into the
//! producer task so the file outlives the response headers and is removed
//! once the operation finishes.

use crate::dispatch::RequestForm;
use crate::error::{ApiError, Result};
use axum::http::HeaderMap;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use podgate_core::engine::{PullOptions, PushOptions, RegistryAuth};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;

/// Header carrying credentials for one registry, or a map of them.
pub const X_REGISTRY_AUTH: &str = "X-Registry-Auth";

/// Header carrying a map of registry credentials.
pub const X_REGISTRY_CONFIG: &str = "X-Registry-Config";

/// Docker's auth config wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerAuthConfig {
    pub username: String,
    pub password: String,
    /// `base64(username:password)`, used when the fields above are empty.
    pub auth: String,
    #[serde(rename = "serveraddress")]
    pub server_address: String,
}

impl DockerAuthConfig {
    fn into_registry_auth(self) -> RegistryAuth {
        if self.username.is_empty() && !self.auth.is_empty() {
            if let Some((username, password)) = decode(&self.auth)
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
                .and_then(|pair| {
                    pair.split_once(':')
                        .map(|(u, p)| (u.to_string(), p.to_string()))
                })
            {
                return RegistryAuth { username, password };
            }
        }
        RegistryAuth {
            username: self.username,
            password: self.password,
        }
    }
}

/// Credentials extracted from a request.
#[derive(Debug, Default)]
pub struct Credentials {
    /// Credentials for the target registry.
    pub auth: Option<RegistryAuth>,
    authfile: Option<TempPath>,
}

impl Credentials {
    /// Temporary `auth.json`, if a credential map was supplied.
    #[must_use]
    pub fn authfile(&self) -> Option<&Path> {
        self.authfile.as_deref()
    }

    /// Returns true if nothing was supplied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.auth.is_none() && self.authfile.is_none()
    }

    /// Copies the credentials into pull options.
    pub fn apply_pull(&self, options: &mut PullOptions) {
        options.credentials.clone_from(&self.auth);
        options.authfile = self.authfile().map(Path::to_path_buf);
    }

    /// Copies the credentials into push options.
    pub fn apply_push(&self, options: &mut PushOptions) {
        options.credentials.clone_from(&self.auth);
        options.authfile = self.authfile().map(Path::to_path_buf);
    }
}

/// Extracts credentials from `headers`. `X-Registry-Config` wins over
/// `X-Registry-Auth`.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] if a header cannot be decoded, or
/// [`ApiError::Io`] if the temporary auth file cannot be written.
pub fn credentials(headers: &HeaderMap, form: &RequestForm) -> Result<Credentials> {
    if headers.contains_key(X_REGISTRY_CONFIG) {
        return config_credentials(headers, form);
    }
    if headers.contains_key(X_REGISTRY_AUTH) {
        return auth_credentials(headers);
    }
    Ok(Credentials::default())
}

fn config_credentials(headers: &HeaderMap, form: &RequestForm) -> Result<Credentials> {
    let mut configs = BTreeMap::new();
    for value in headers.get_all(X_REGISTRY_CONFIG) {
        let raw = value
            .to_str()
            .map_err(|e| bad_header(X_REGISTRY_CONFIG, e))?;
        let decoded = decode(raw).map_err(|e| bad_header(X_REGISTRY_CONFIG, e))?;
        let map: HashMap<String, DockerAuthConfig> =
            serde_json::from_slice(&decoded).map_err(|e| bad_header(X_REGISTRY_CONFIG, e))?;
        configs.extend(
            map.into_iter()
                .map(|(registry, config)| (registry, config.into_registry_auth())),
        );
    }

    let mut auth = configs.get("").cloned();
    let registries = form.get_all("registry");
    if !registries.is_empty() {
        let specific = registries.iter().find_map(|wanted| {
            configs
                .iter()
                .find(|(registry, _)| registry.contains(wanted))
                .map(|(_, config)| config.clone())
        });
        if specific.is_some() {
            auth = specific;
        } else {
            tracing::debug!(?registries, "no {} entry matches the requested registry", X_REGISTRY_CONFIG);
        }
    }

    Ok(Credentials {
        auth,
        authfile: write_authfile(&configs)?,
    })
}

fn auth_credentials(headers: &HeaderMap) -> Result<Credentials> {
    let raw = headers
        .get(X_REGISTRY_AUTH)
        .map(|v| v.to_str().map_err(|e| bad_header(X_REGISTRY_AUTH, e)))
        .transpose()?
        .unwrap_or_default()
        .trim();
    // Some clients send a literal "null" for "no credentials".
    if raw.is_empty() || raw == "null" {
        return Ok(Credentials::default());
    }
    let decoded = decode(raw).map_err(|e| bad_header(X_REGISTRY_AUTH, e))?;

    if let Ok(map) = serde_json::from_slice::<HashMap<String, DockerAuthConfig>>(&decoded) {
        let configs: BTreeMap<String, RegistryAuth> = map
            .into_iter()
            .map(|(registry, config)| (registry, config.into_registry_auth()))
            .collect();
        return Ok(Credentials {
            auth: None,
            authfile: write_authfile(&configs)?,
        });
    }

    let single: DockerAuthConfig =
        serde_json::from_slice(&decoded).map_err(|e| bad_header(X_REGISTRY_AUTH, e))?;
    let auth = single.into_registry_auth();
    Ok(Credentials {
        auth: (!auth.username.is_empty() || !auth.password.is_empty()).then_some(auth),
        authfile: None,
    })
}

/// Writes `configs` in `auth.json` format. Returns `None` when there is
/// nothing to write.
fn write_authfile(configs: &BTreeMap<String, RegistryAuth>) -> Result<Option<TempPath>> {
    #[derive(Serialize)]
    struct AuthFile<'a> {
        auths: BTreeMap<&'a str, AuthEntry>,
    }
    #[derive(Serialize)]
    struct AuthEntry {
        auth: String,
    }

    let auths: BTreeMap<&str, AuthEntry> = configs
        .iter()
        .filter(|(registry, _)| !registry.is_empty())
        .map(|(registry, config)| {
            let pair = format!("{}:{}", config.username, config.password);
            (registry.as_str(), AuthEntry { auth: STANDARD.encode(pair) })
        })
        .collect();
    if auths.is_empty() {
        return Ok(None);
    }

    let mut file = tempfile::Builder::new().prefix("auth.json.").tempfile()?;
    serde_json::to_writer(&mut file, &AuthFile { auths })
        .map_err(|e| ApiError::Server(format!("error storing credentials in temporary auth file: {e}")))?;
    file.flush()?;
    Ok(Some(file.into_temp_path()))
}

fn decode(raw: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let raw = raw.trim();
    URL_SAFE
        .decode(raw)
        .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
        .or_else(|_| STANDARD.decode(raw))
}

fn bad_header(header: &str, err: impl std::fmt::Display) -> ApiError {
    ApiError::BadRequest(format!("failed to parse {header:?} header: {err}"))
}
