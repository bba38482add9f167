//! OCI image reference parsing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Invalid image reference: {0}")]
    Invalid(String),
}

/// A parsed `[registry/]repo[:tag|@digest]` pull reference.
///
/// Follows docker's heuristics: the first path segment is a registry host
/// only if it contains a dot or a colon, or is exactly `localhost`. Bare
/// repositories on docker.io gain the implicit `library/` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    original: String,
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        if reference.is_empty() {
            return Err(ReferenceError::Invalid(reference.to_string()));
        }

        let mut remainder = reference;

        let digest = match remainder.split_once('@') {
            Some((rest, d)) => {
                remainder = rest;
                Some(d.to_string())
            }
            None => None,
        };

        // a colon after the last slash is a tag, before it a registry port
        let tag = match remainder.rsplit_once(':') {
            Some((rest, t)) if !t.contains('/') => {
                remainder = rest;
                Some(t.to_string())
            }
            _ => None,
        };

        if remainder.is_empty() {
            return Err(ReferenceError::Invalid(reference.to_string()));
        }

        let (registry, repository) = match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => ("docker.io".to_string(), remainder.to_string()),
        };

        if repository.is_empty() {
            return Err(ReferenceError::Invalid(reference.to_string()));
        }

        let repository = if registry == "docker.io" && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(ImageRef {
            original: reference.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference exactly as the user wrote it
    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// What to ask the registry for: digest if pinned, else tag, else `latest`
    pub fn manifest_reference(&self) -> &str {
        if let Some(digest) = &self.digest {
            return digest;
        }
        self.tag.as_deref().unwrap_or("latest")
    }

    /// Base URL of the distribution endpoint serving this reference.
    ///
    /// docker.io is special-cased to its real endpoint. Hosts without a dot
    /// (development registries, localhost) are assumed to speak plain http.
    pub fn registry_endpoint(&self) -> String {
        if self.registry == "docker.io" || self.registry == "index.docker.io" {
            return "https://registry-1.docker.io".to_string();
        }
        let host = self.registry.split(':').next().unwrap_or(&self.registry);
        if host.contains('.') {
            format!("https://{}", self.registry)
        } else {
            format!("http://{}", self.registry)
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_repo_defaults_to_docker_library() {
        let r = ImageRef::parse("alpine:3").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.manifest_reference(), "3");
    }

    #[test]
    fn missing_tag_defaults_to_latest() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.manifest_reference(), "latest");
    }

    #[test]
    fn scoped_repo_on_docker_io_keeps_its_path() {
        let r = ImageRef::parse("grafana/grafana:10.0.0").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "grafana/grafana");
    }

    #[test]
    fn explicit_registry_with_port() {
        let r = ImageRef::parse("registry.example.com:5000/team/app:v1").unwrap();
        assert_eq!(r.registry(), "registry.example.com:5000");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.manifest_reference(), "v1");
        assert_eq!(
            r.registry_endpoint(),
            "https://registry.example.com:5000"
        );
    }

    #[test]
    fn digest_reference_wins_over_tag() {
        let r = ImageRef::parse("ghcr.io/foo/bar:latest@sha256:abcd").unwrap();
        assert_eq!(r.manifest_reference(), "sha256:abcd");
    }

    #[test]
    fn localhost_registry_uses_http() {
        let r = ImageRef::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.registry_endpoint(), "http://localhost:5000");
    }

    #[test]
    fn docker_io_resolves_to_real_endpoint() {
        let r = ImageRef::parse("alpine").unwrap();
        assert_eq!(r.registry_endpoint(), "https://registry-1.docker.io");
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("example.com/").is_err());
    }
}
