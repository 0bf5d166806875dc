//! Image reference parsing and normalization.
//!
//! Accepts the familiar short forms (`alpine`, `library/alpine:3.20`,
//! `quay.io/podman/stable`) and normalizes them to a fully qualified
//! `domain/path:tag` reference.

use crate::error::{EngineError, Result};
use std::fmt;

/// Registry used for references without an explicit domain.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Tag used when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// A normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with optional port.
    pub domain: String,
    /// Repository path within the registry.
    pub path: String,
    /// Tag.
    pub tag: String,
}

impl ImageReference {
    /// Parses and normalizes `input`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for empty or malformed input.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidArgument(format!("invalid reference format: {input:?}"));

        let input = input.trim();
        if input.is_empty() {
            return Err(invalid());
        }

        // The tag separator is the last ':' that comes after the last '/'.
        let last_slash = input.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match input[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&input[..split], Some(&input[split + 1..]))
            }
            None => (input, None),
        };

        let (domain, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        };
        let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
            format!("library/{path}")
        } else {
            path
        };

        if !path.split('/').all(is_valid_path_component) {
            return Err(invalid());
        }
        let tag = tag.unwrap_or(DEFAULT_TAG);
        if !is_valid_tag(tag) {
            return Err(invalid());
        }

        Ok(Self {
            domain,
            path,
            tag: tag.to_string(),
        })
    }

    /// Returns `domain/path` without the tag.
    #[must_use]
    pub fn repository(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Returns a copy pointing at another tag of the same repository.
    #[must_use]
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.domain, self.path, self.tag)
    }
}

fn is_valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
        && component.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && !tag.starts_with(['.', '-'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_normalized() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:latest");

        let r = ImageReference::parse("library/alpine:3.20").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:3.20");
    }

    #[test]
    fn explicit_domain_and_port_are_kept() {
        let r = ImageReference::parse("quay.io/podman/stable:v5").unwrap();
        assert_eq!(r.domain, "quay.io");
        assert_eq!(r.path, "podman/stable");
        assert_eq!(r.tag, "v5");

        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.domain, "localhost:5000");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.repository(), "localhost:5000/app");
    }

    #[test]
    fn malformed_references_are_rejected() {
        for bad in ["", "  ", "UPPER/case", "alpine:", "alpine:-bad", "a//b", "quay.io/"] {
            assert!(ImageReference::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
